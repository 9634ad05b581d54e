// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::ListenerError;
use std::path::PathBuf;
use std::sync::Mutex;

/// Durable home of the listener's last processed height.
pub trait CursorStore: Send + Sync {
    fn load(&self) -> Result<Option<u64>, ListenerError>;
    fn save(&self, height: u64) -> Result<(), ListenerError>;
}

/// Plain-text decimal height, overwritten on every save.
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<Option<u64>, ListenerError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| ListenerError::Storage(format!("read {:?}: {}", self.path, e)))?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ListenerError::Storage(format!("parse {:?}: {}", self.path, e)))
    }

    fn save(&self, height: u64) -> Result<(), ListenerError> {
        std::fs::write(&self.path, height.to_string())
            .map_err(|e| ListenerError::Storage(format!("write {:?}: {}", self.path, e)))
    }
}

#[derive(Default)]
pub struct InMemoryCursorStore {
    height: Mutex<Option<u64>>,
}

impl InMemoryCursorStore {
    pub fn new(height: Option<u64>) -> Self {
        Self {
            height: Mutex::new(height),
        }
    }
}

impl CursorStore for InMemoryCursorStore {
    fn load(&self) -> Result<Option<u64>, ListenerError> {
        self.height
            .lock()
            .map(|h| *h)
            .map_err(|_| ListenerError::Storage("cursor lock poisoned".into()))
    }

    fn save(&self, height: u64) -> Result<(), ListenerError> {
        *self
            .height
            .lock()
            .map_err(|_| ListenerError::Storage("cursor lock poisoned".into()))? = Some(height);
        Ok(())
    }
}
