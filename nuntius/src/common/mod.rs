// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod config;
pub mod connector;
pub mod protocol;
pub mod remote_stream;
pub mod session;
