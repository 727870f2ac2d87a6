// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Correlation Registry
//!
//! Maps correlation ids to one-shot reply waiters for a single queue handle.
//!
//! A slot goes through up to three steps, all performed under one lock:
//! - `reserve`: created by `publish` before the request leaves, so an early
//!   reply has somewhere to land. Unclaimed slots expire at their deadline.
//! - `claim`: taken by `reply_of`, which then awaits the slot until its deadline.
//!   Claiming an id that was never reserved opens a fresh slot.
//! - `resolve`: called by the reply listener. A claimed slot is removed and its
//!   waiter woken; an unclaimed one keeps the reply buffered until claimed.
//!
//! Replies for ids without a slot are dropped. Every slot carries a generation
//! so a late release can never remove a newer slot reusing the same id.

use crate::{errors::AmqpError, provider::Delivery};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    time::{self, Instant},
};
use tracing::{debug, warn};

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

struct Waiter {
    generation: u64,
    deadline: Instant,
    sender: Option<oneshot::Sender<Delivery>>,
    /// Present until the slot is claimed.
    receiver: Option<oneshot::Receiver<Delivery>>,
}

pub(crate) struct CorrelationRegistry {
    waiters: Mutex<HashMap<String, Waiter>>,
    timeout: Duration,
    capacity: usize,
    generation: AtomicU64,
}

impl CorrelationRegistry {
    pub(crate) fn new(timeout: Duration, capacity: usize) -> Arc<CorrelationRegistry> {
        Arc::new(CorrelationRegistry {
            waiters: Mutex::new(HashMap::new()),
            timeout,
            capacity,
            generation: AtomicU64::new(0),
        })
    }

    /// Number of slots currently held.
    pub(crate) fn len(&self) -> usize {
        self.waiters().len()
    }

    /// Opens a slot for `id` and schedules its expiry.
    ///
    /// # Parameters
    /// * `id` - Correlation id of the request about to be sent
    ///
    /// # Returns
    /// The slot generation, used to release exactly this slot later.
    /// `DuplicateCorrelationId` if the id already has a slot, `RegistryFull`
    /// when the bound is reached.
    pub(crate) fn reserve(self: &Arc<Self>, id: &str) -> Result<u64, AmqpError> {
        let deadline = self.deadline();
        let generation = {
            let mut waiters = self.waiters();
            self.check_vacancy(&waiters, id)?;

            let (sender, receiver) = oneshot::channel();
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            waiters.insert(
                id.to_owned(),
                Waiter {
                    generation,
                    deadline,
                    sender: Some(sender),
                    receiver: Some(receiver),
                },
            );
            generation
        };

        let registry = Arc::downgrade(self);
        let id = id.to_owned();
        tokio::spawn(async move {
            time::sleep_until(deadline).await;
            if let Some(registry) = registry.upgrade() {
                if registry.release(&id, generation) {
                    debug!(correlation_id = id, "reply slot expired");
                }
            }
        });

        Ok(generation)
    }

    /// Takes the waiting side of the slot for `id`, opening one if needed.
    ///
    /// Opening a slot here is subject to the same bound as `reserve`.
    pub(crate) fn claim(self: &Arc<Self>, id: &str) -> Result<PendingReply, AmqpError> {
        let mut waiters = self.waiters();

        if let Some(waiter) = waiters.get_mut(id) {
            let Some(receiver) = waiter.receiver.take() else {
                return Err(AmqpError::DuplicateCorrelationId(id.to_owned()));
            };

            return Ok(PendingReply {
                id: id.to_owned(),
                generation: waiter.generation,
                deadline: waiter.deadline,
                receiver,
                registry: self.clone(),
            });
        }

        self.check_vacancy(&waiters, id)?;

        let (sender, receiver) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = self.deadline();
        waiters.insert(
            id.to_owned(),
            Waiter {
                generation,
                deadline,
                sender: Some(sender),
                receiver: None,
            },
        );

        Ok(PendingReply {
            id: id.to_owned(),
            generation,
            deadline,
            receiver,
            registry: self.clone(),
        })
    }

    /// Hands a reply to the slot matching its correlation id.
    ///
    /// Returns `false` when the reply had nowhere to go.
    pub(crate) fn resolve(&self, delivery: Delivery) -> bool {
        let Some(id) = delivery.properties.correlation_id.clone() else {
            return false;
        };

        let mut waiters = self.waiters();
        let Some(waiter) = waiters.get_mut(&id) else {
            return false;
        };

        // A second reply for the same id finds the sender already spent.
        let Some(sender) = waiter.sender.take() else {
            return false;
        };

        if waiter.receiver.is_none() {
            waiters.remove(&id);
        }

        sender.send(delivery).is_ok()
    }

    /// Removes the slot for `id` if it still belongs to `generation`.
    pub(crate) fn release(&self, id: &str, generation: u64) -> bool {
        let mut waiters = self.waiters();
        match waiters.get(id) {
            Some(waiter) if waiter.generation == generation => {
                waiters.remove(id);
                true
            }
            _ => false,
        }
    }

    fn check_vacancy(
        &self,
        waiters: &HashMap<String, Waiter>,
        id: &str,
    ) -> Result<(), AmqpError> {
        if waiters.contains_key(id) {
            return Err(AmqpError::DuplicateCorrelationId(id.to_owned()));
        }

        if waiters.len() >= self.capacity {
            warn!(limit = self.capacity, "correlation registry is full");
            return Err(AmqpError::RegistryFull(self.capacity));
        }

        Ok(())
    }

    /// Deadline of a slot opened now. Timeouts too large to represent wait for a year.
    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.timeout)
            .unwrap_or_else(|| now + FAR_FUTURE)
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A claimed slot. Dropping it releases the slot.
pub(crate) struct PendingReply {
    id: String,
    generation: u64,
    deadline: Instant,
    receiver: oneshot::Receiver<Delivery>,
    registry: Arc<CorrelationRegistry>,
}

impl PendingReply {
    /// Waits for the reply until the slot deadline.
    pub(crate) async fn wait(mut self) -> Result<Delivery, AmqpError> {
        match time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(delivery)) => Ok(delivery),
            // The sender only goes away when the slot expired underneath us.
            Ok(Err(_)) | Err(_) => {
                warn!(correlation_id = self.id, "no reply before deadline");
                Err(AmqpError::ReplyTimeout(self.id.clone()))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.release(&self.id, self.generation);
    }
}
