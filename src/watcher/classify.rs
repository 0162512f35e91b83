use std::path::PathBuf;

use notify::EventKind;
use notify::event::{ModifyKind, RenameMode};

use crate::core::{Operation, is_package_file};
use crate::utils::normalize_path;

/// Map one raw notify event to per-path operations on package files.
///
/// Renames split into a Delete of the old name and a Create of the new one.
/// Metadata-only changes (mtime/atime/chmod noise) are dropped.
pub(super) fn raw_operations(event: &notify::Event) -> Vec<(PathBuf, Operation)> {
    let tagged: Vec<(&PathBuf, Operation)> = match event.kind {
        EventKind::Create(_) => with_op(&event.paths, Operation::Create),
        EventKind::Remove(_) => with_op(&event.paths, Operation::Delete),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            with_op(&event.paths, Operation::Delete)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            with_op(&event.paths, Operation::Create)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut ops = Vec::new();
            if let Some(from) = event.paths.first() {
                ops.push((from, Operation::Delete));
            }
            if let Some(to) = event.paths.get(1) {
                ops.push((to, Operation::Create));
            }
            ops
        }
        EventKind::Modify(_) => with_op(&event.paths, Operation::Modify),
        _ => Vec::new(),
    };

    tagged
        .into_iter()
        .filter(|(path, _)| is_package_file(path))
        .map(|(path, op)| (normalize_path(path), op))
        .collect()
}

fn with_op(paths: &[PathBuf], op: Operation) -> Vec<(&PathBuf, Operation)> {
    paths.iter().map(|p| (p, op)).collect()
}
