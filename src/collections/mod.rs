// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod frame_queue;
pub mod segment_store;
