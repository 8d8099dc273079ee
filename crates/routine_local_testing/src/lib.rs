// Copyright (c) Microsoft Corporation.

mod test_setup;

pub use test_setup::*;
