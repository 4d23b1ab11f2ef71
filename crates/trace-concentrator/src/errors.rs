// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors from the concentrator lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ConcentratorError {
    #[error("Concentrator channels are already initialized")]
    AlreadyInitialized,

    #[error("Concentrator channels must be initialized before start")]
    NotInitialized,

    #[error("Concentrator already started")]
    AlreadyStarted,

    #[error("Concentrator worker failed: {0}")]
    WorkerPanicked(String),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Errors raised while building a [`crate::config::ConcentratorConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid bucket duration: {0}")]
    InvalidBucketDuration(String),

    #[error("Invalid eps: {0}")]
    InvalidEps(String),

    #[error("Invalid boolean flag: {0}")]
    InvalidFlag(String),
}
