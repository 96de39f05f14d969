// src/lib.rs

pub mod types;
pub mod hasher;
pub mod pow;
pub mod ledger;
pub mod validation;
pub mod consensus;
pub mod sync;
pub mod storage;
pub mod config;
pub mod runtime;
pub mod http;
