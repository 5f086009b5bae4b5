// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Type-name registry of sub-task implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};

use super::executable::Executable;
use super::types::TaskFlags;

type Factory = Arc<dyn Fn() -> Box<dyn Executable> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    flags: TaskFlags,
    factory: Factory,
}

/// Map from task-type name to a factory and its default capability flags.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    types: HashMap<String, Registration>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.types.keys().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("types", &names).finish()
    }
}

impl TaskRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `type_name`. A later registration under the same name wins.
    pub fn register<F, T>(&mut self, type_name: impl Into<String>, flags: TaskFlags, factory: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Executable + 'static,
    {
        let factory: Factory = Arc::new(move || Box::new(factory()) as Box<dyn Executable>);
        self.types
            .insert(type_name.into(), Registration { flags, factory });
    }

    /// Whether `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Default flags of `type_name`.
    pub fn flags(&self, type_name: &str) -> Result<TaskFlags> {
        self.types
            .get(type_name)
            .map(|r| r.flags)
            .ok_or_else(|| Error::with_args(ErrorKind::TaskTypeNotRegistered, [type_name]))
    }

    /// A fresh instance of `type_name`.
    pub fn create(&self, type_name: &str) -> Result<Box<dyn Executable>> {
        self.types
            .get(type_name)
            .map(|r| (r.factory)())
            .ok_or_else(|| Error::with_args(ErrorKind::TaskTypeNotRegistered, [type_name]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::executable::{ExecutionEnv, TaskResult};

    struct Noop;

    #[async_trait::async_trait]
    impl Executable for Noop {
        async fn execute(&self, _env: &mut ExecutionEnv) -> TaskResult {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = TaskRegistry::new();
        registry.register("Noop", TaskFlags::new().passable(), || Noop);

        assert!(registry.contains("Noop"));
        assert!(registry.flags("Noop").unwrap().can_pass);
        assert!(registry.create("Noop").is_ok());

        let err = registry.create("Missing").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::TaskTypeNotRegistered);
    }
}
