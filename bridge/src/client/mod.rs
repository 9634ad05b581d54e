// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod notary_client;
pub mod proof_collector;
