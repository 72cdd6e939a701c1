//! Run environment: the artifact name -> value map for one run
//!
//! Batch values are shared (`Arc<Table>` / cloned literals). Stream values
//! are single-pass, so lending one moves it out of the environment.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::TraktError;
use crate::value::StepValue;

#[derive(Debug, Default)]
pub struct Environment {
    values: IndexMap<String, StepValue>,
    /// Names that were bound once and then consumed (streams)
    consumed: HashSet<String>,
    /// Optional inputs that resolved to no files
    absent: HashSet<String>,
    streaming: bool,
}

impl Environment {
    pub fn new(streaming: bool) -> Self {
        Self {
            streaming,
            ..Default::default()
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Bind an artifact. Each name binds at most once per run.
    pub fn bind(&mut self, name: impl Into<String>, value: StepValue) -> Result<(), TraktError> {
        let name = name.into();
        if self.is_defined(&name) {
            return Err(TraktError::ArtifactCollision { artifact: name });
        }
        self.values.insert(name, value);
        Ok(())
    }

    /// Record an optional input with no data; it resolves to a null literal
    pub fn bind_absent(&mut self, name: impl Into<String>) -> Result<(), TraktError> {
        let name = name.into();
        if self.is_defined(&name) {
            return Err(TraktError::ArtifactCollision { artifact: name });
        }
        self.absent.insert(name);
        Ok(())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.consumed.contains(name) || self.absent.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<&StepValue> {
        self.values.get(name)
    }

    /// Hand out a value for a binding: shared copy, or the stream itself
    pub fn lend(&mut self, name: &str) -> Option<StepValue> {
        if self.absent.contains(name) {
            return Some(StepValue::Literal(Value::Null));
        }
        let shared = self.values.get(name)?.try_share();
        match shared {
            Some(value) => Some(value),
            None => self.take(name),
        }
    }

    /// Move a value out (used for streams and final outputs)
    pub fn take(&mut self, name: &str) -> Option<StepValue> {
        let value = self.values.shift_remove(name)?;
        self.consumed.insert(name.to_string());
        Some(value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Cell, Table};
    use crate::value::ChunkStream;

    fn table() -> Table {
        Table::from_rows(["id"], vec![vec![Cell::Int(1)]]).unwrap()
    }

    #[test]
    fn test_tables_are_shared() {
        let mut env = Environment::new(false);
        env.bind("a", table().into()).unwrap();
        assert!(env.lend("a").is_some());
        assert!(env.lend("a").is_some());
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_streams_are_lent_once() {
        let mut env = Environment::new(true);
        env.bind("s", ChunkStream::from_tables(vec![table()]).into())
            .unwrap();
        assert!(matches!(env.lend("s"), Some(StepValue::Stream(_))));
        assert!(env.lend("s").is_none());
        // consumed names still count as defined
        assert!(matches!(
            env.bind("s", table().into()),
            Err(TraktError::ArtifactCollision { .. })
        ));
    }

    #[test]
    fn test_absent_optional_resolves_to_null() {
        let mut env = Environment::new(false);
        env.bind_absent("lookup").unwrap();
        assert!(matches!(
            env.lend("lookup"),
            Some(StepValue::Literal(Value::Null))
        ));
    }

    #[test]
    fn test_collision_rejected() {
        let mut env = Environment::new(false);
        env.bind("a", table().into()).unwrap();
        assert!(env.bind("a", table().into()).is_err());
    }
}
