//! Execution order of planned filesystem actions.
//!
//! Rank order:
//!
//! | rank | action |
//! |------|--------|
//! | 0 | conflict copies |
//! | 1 | delete file |
//! | 2 | delete symlink |
//! | 3 | rename folder |
//! | 4 | new folder |
//! | 5 | new file |
//! | 6 | new symlink |
//! | 7 | rename file |
//! | 8 | rename symlink |
//! | 9 | change |
//! | 10 | delete folder |
//! | 11 | set attributes |
//!
//! Within a rank deletions run deepest path first and everything else in path
//! order, so parents are created before children and removed after them. A
//! file or symlink that takes the place of a deleted folder is moved right
//! behind that deletion.

use std::cmp::Ordering;

use peersync_meta::FileType;

use crate::actions::FileSystemAction;

fn rank(action: &FileSystemAction) -> u8 {
    use FileSystemAction::*;
    match (action, action.file_type()) {
        (Conflict { .. }, _) => 0,
        (Delete { .. }, FileType::File) => 1,
        (Delete { .. }, FileType::Symlink) => 2,
        (Rename { .. }, FileType::Folder) => 3,
        (New { .. }, FileType::Folder) => 4,
        (New { .. }, FileType::File) => 5,
        (New { .. }, FileType::Symlink) => 6,
        (Rename { .. }, FileType::File) => 7,
        (Rename { .. }, FileType::Symlink) => 8,
        (Change { .. }, _) => 9,
        (Delete { .. }, FileType::Folder) => 10,
        (SetAttributes { .. }, _) => 11,
    }
}

fn is_delete(action: &FileSystemAction) -> bool {
    matches!(action, FileSystemAction::Delete { .. })
}

fn is_folder_delete(action: &FileSystemAction) -> bool {
    is_delete(action) && action.file_type() == FileType::Folder
}

fn replaces_folder(action: &FileSystemAction, path: &str) -> bool {
    matches!(action, FileSystemAction::New { .. } | FileSystemAction::Rename { .. })
        && action.file_type() != FileType::Folder
        && action.path() == path
}

fn compare(a: &FileSystemAction, b: &FileSystemAction) -> Ordering {
    rank(a).cmp(&rank(b)).then_with(|| {
        if is_delete(a) {
            b.path().cmp(a.path())
        } else {
            a.path().cmp(b.path())
        }
    })
}

/// Sort actions into execution order
pub fn order_actions(mut actions: Vec<FileSystemAction>) -> Vec<FileSystemAction> {
    actions.sort_by(compare);

    let mut i = 0;
    while i < actions.len() {
        if is_folder_delete(&actions[i]) {
            let path = actions[i].path().to_string();
            let mut j = 0;
            while j < i {
                if replaces_folder(&actions[j], &path) {
                    let moved = actions.remove(j);
                    i -= 1;
                    actions.insert(i + 1, moved);
                } else {
                    j += 1;
                }
            }
        }
        i += 1;
    }
    actions
}
