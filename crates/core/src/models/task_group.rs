use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;

/// 任务组：一个具名的并发容量单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub capacity: usize,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::invalid_argument("task group name must not be empty"));
        }
        if self.capacity == 0 {
            return Err(SchedulerError::invalid_argument(format!(
                "task group {} must have a positive capacity",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_group_validation() {
        assert!(TaskGroup::new("default", 4).validate().is_ok());
        assert!(TaskGroup::new("", 4).validate().is_err());
        assert!(TaskGroup::new("g", 0).validate().is_err());
    }
}
