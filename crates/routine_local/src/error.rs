// Copyright (c) Microsoft Corporation.

use thiserror::Error;

use crate::routine::RoutineId;

#[derive(Debug, Error)]
pub enum Error {
    /// A value had to be created for a routine but the store was built without a factory.
    /// This is a configuration error in the code that owns the store.
    #[error("no factory is configured to create the value for {routine}")]
    NoFactory { routine: RoutineId },

    #[error("invalid options specified: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, Error>;
