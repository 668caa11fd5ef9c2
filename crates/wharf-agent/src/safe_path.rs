//! Workspace path confinement.

use std::path::{Component, Path, PathBuf};

fn push_lexical(out: &mut PathBuf, path: &Path) {
    for comp in path.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
}

/// Resolve a user-supplied path against the workspace root.
///
/// The joined path is normalized lexically (no filesystem access). If the
/// result stays inside the workspace it is returned as-is; otherwise every
/// `..` segment of the user path is stripped and the remainder rejoined
/// under the workspace. The caller never learns that an escape was
/// attempted - the output is always a descendant of `workdir`.
pub fn resolve(workdir: &Path, user_path: &str) -> PathBuf {
    let mut base = PathBuf::from("/");
    push_lexical(&mut base, workdir);

    let mut candidate = base.clone();
    push_lexical(&mut candidate, Path::new(user_path));
    if candidate.starts_with(&base) {
        return candidate;
    }

    let mut safe = base;
    for comp in Path::new(user_path).components() {
        if let Component::Normal(c) = comp {
            safe.push(c);
        }
    }
    safe
}
