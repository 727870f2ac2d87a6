// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection Settings
//!
//! Connection parameters used by the lapin channel provider. The struct is
//! deserializable so it can be embedded in whatever configuration document the
//! application already loads.

use serde::Deserialize;

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Virtual host, already URI encoded (`%2f` is the default vhost `/`).
    pub vhost: String,
    /// Name reported to the broker for the connection.
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "%2f".to_owned(),
            connection_name: "rabbitmq-queue".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these settings.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}
