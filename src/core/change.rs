use std::path::PathBuf;

/// What happened to a package file, after coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Modify,
    Delete,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }

    /// Fold a newer raw operation into an already pending one.
    ///
    /// - Delete then Create: the file was recreated, resolve to Create
    /// - anything then Delete: delete always wins
    /// - otherwise the pending operation is kept
    pub fn coalesce(self, newer: Operation) -> Operation {
        match (self, newer) {
            (Self::Delete, Self::Create) => Self::Create,
            (_, Self::Delete) => Self::Delete,
            (existing, _) => existing,
        }
    }
}

/// A debounced change to one package file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub operation: Operation,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, operation: Operation) -> Self {
        Self {
            path: path.into(),
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Operation::*;
    use super::*;

    fn fold(ops: &[Operation]) -> Operation {
        let (first, rest) = ops.split_first().unwrap();
        rest.iter().fold(*first, |acc, op| acc.coalesce(*op))
    }

    #[test]
    fn test_create_then_modify_stays_create() {
        assert_eq!(fold(&[Create, Modify]), Create);
    }

    #[test]
    fn test_delete_then_create_is_create() {
        assert_eq!(fold(&[Delete, Create]), Create);
    }

    #[test]
    fn test_modify_then_delete_is_delete() {
        assert_eq!(fold(&[Modify, Delete]), Delete);
        assert_eq!(fold(&[Create, Delete]), Delete);
    }

    #[test]
    fn test_create_delete_create_is_create() {
        assert_eq!(fold(&[Create, Delete, Create]), Create);
    }

    #[test]
    fn test_delete_then_modify_stays_delete() {
        // Only Create revives a pending delete.
        assert_eq!(fold(&[Delete, Modify]), Delete);
    }

    #[test]
    fn test_modify_then_create_stays_modify() {
        assert_eq!(fold(&[Modify, Create]), Modify);
        assert_eq!(fold(&[Modify, Modify, Modify]), Modify);
    }
}
