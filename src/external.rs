//! Executable-path resolution, mirroring `execvp`'s search rules.

use std::borrow::Cow;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it exists.
/// - Relative with multiple components (e.g., `bin/sh`): returns it if it exists.
/// - `./foo` on Unix or any `./`-prefixed path on other platforms: returns it if it exists.
/// - Single path component (no separators): search each directory in `search_paths` (PATH)
///   and return the first existing match.
/// - Empty path: returns `None`.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    if path.is_absolute() {
        return find_by_path(path).map(Cow::Borrowed);
    }

    let search_in_current_dir = cfg!(not(unix)) || path.starts_with("./");
    if search_in_current_dir && path.exists() {
        return Some(Cow::Borrowed(path));
    }

    let mut components = path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        (None, None) => None,
        (Some(x), None) => find_in_path(search_paths, x.as_os_str()).map(Cow::Owned),
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    for dir in std::env::split_paths(search_paths) {
        let path = dir.join(cmd);
        if let Some(path) = find_by_path(&path) {
            return Some(path.to_owned());
        }
    }
    None
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if path.exists() { Some(path) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::fs;
    use std::fs::File;

    #[cfg(unix)]
    fn osstr(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    #[cfg(unix)]
    fn absolute_existing_true() {
        let path = Path::new("/bin/sh");
        let res = find_command_path(osstr("/bin"), path);
        assert!(res.is_some(), "Expected to find /bin/sh via absolute path");
        let found = res.unwrap();
        assert_eq!(found.as_ref(), path);
    }

    #[test]
    #[cfg(unix)]
    fn absolute_nonexisting() {
        let path = Path::new("/bin/nonexisting");
        let res = find_command_path(osstr("/bin"), path);
        assert!(
            res.is_none(),
            "Expected not to find /bin/nonexisting via absolute path"
        );
    }

    #[test]
    #[cfg(unix)]
    fn single_component_found_in_path() {
        let path = Path::new("sh");
        let res = find_command_path(osstr("/bin"), path);
        let found = res.expect("Expected to find 'sh' in /bin via PATH search");
        assert!(found.as_ref().ends_with("sh"));
        assert!(found.as_ref().starts_with("/bin"));
    }

    #[test]
    #[cfg(unix)]
    fn single_component_not_found_in_path() {
        let path = Path::new("nonexisting");
        let res = find_command_path(osstr("/bin"), path);
        assert!(res.is_none(), "Expected not to find 'nonexisting' in PATH");
    }

    #[test]
    #[cfg(unix)]
    fn multiple_components_relative_existing() {
        let cwd_before = std::env::current_dir().expect("cwd");
        let tmp_base =
            std::env::temp_dir().join(format!("external_tests_{}_mc", std::process::id()));
        let _ = fs::remove_dir_all(&tmp_base);
        fs::create_dir_all(tmp_base.join("bin")).expect("create temp bin dir");
        let file_path = tmp_base.join("bin").join("sh");
        File::create(&file_path).expect("touch bin/sh");

        std::env::set_current_dir(&tmp_base).expect("set cwd");
        let res = find_command_path(osstr("/does/not/matter"), Path::new("bin/sh"));
        std::env::set_current_dir(&cwd_before).ok();

        let found = res.expect("Expected to find relative 'bin/sh' in current dir");
        assert!(found.as_ref().ends_with("bin/sh"));
        let _ = fs::remove_dir_all(tmp_base);
    }

    #[test]
    #[cfg(unix)]
    fn current_dir_with_dot_prefix() {
        let cwd_before = std::env::current_dir().expect("cwd");
        let tmp_base =
            std::env::temp_dir().join(format!("external_tests_{}_dot", std::process::id()));
        let _ = fs::remove_dir_all(&tmp_base);
        fs::create_dir_all(&tmp_base).expect("create temp dir");
        let file_path = tmp_base.join("foo");
        File::create(&file_path).expect("touch foo");

        std::env::set_current_dir(&tmp_base).expect("set cwd");
        let res = find_command_path(osstr("/bin"), Path::new("./foo"));
        std::env::set_current_dir(&cwd_before).ok();

        let found = res.expect("Expected to find './foo' in current dir");
        assert_eq!(found.as_ref(), Path::new("./foo"));
        let _ = fs::remove_dir_all(tmp_base);
    }

    #[test]
    #[cfg(unix)]
    fn empty_path_is_none() {
        let res = find_command_path(osstr("/bin"), Path::new(""));
        assert!(res.is_none(), "Empty path should not resolve to anything");
    }
}
