use std::collections::HashSet;
use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::TransformError;
use crate::pipeline::Asset;

/// Splits a glob into its static root and the remaining wildcard suffix.
///
/// `assets/sass/**/*.scss` becomes (`assets/sass`, `**/*.scss`), while a
/// literal path is returned whole with an empty suffix.
pub(crate) fn split_glob(glob: &str) -> (Utf8PathBuf, Utf8PathBuf) {
    let path = Utf8Path::new(glob);

    let components: Vec<_> = path
        .components()
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect();
    let split_idx = components
        .iter()
        .position(|c| c.as_str().contains(['*', '?', '[']))
        .unwrap_or(components.len());

    let root: Utf8PathBuf = components.iter().take(split_idx).collect();
    let suffix: Utf8PathBuf = components.iter().skip(split_idx).collect();

    (root, suffix)
}

/// Directory that output paths are made relative to.
///
/// For a wildcard glob this is its static root; for a literal file it is the
/// file's parent directory.
pub(crate) fn glob_base(glob: &str) -> Utf8PathBuf {
    let (root, suffix) = split_glob(glob);

    if suffix.as_str().is_empty() {
        root.parent().map(Utf8Path::to_path_buf).unwrap_or_default()
    } else {
        root
    }
}

/// Reads every file matched by `globs`.
///
/// Files are ordered glob by glob, then by path. A file matched by more than
/// one glob keeps its first position. Unreadable entries are reported through
/// `on_error` and skipped; no match at all is not an error.
pub(crate) fn read(globs: &[String], on_error: impl Fn(TransformError)) -> Vec<Asset> {
    let mut seen = HashSet::new();
    let mut assets = Vec::new();

    for pattern in globs {
        let base = glob_base(pattern);

        let entries = match glob::glob(pattern) {
            Ok(entries) => entries,
            Err(e) => {
                on_error(source_error(pattern.into(), e.into()));
                continue;
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => match Utf8PathBuf::try_from(path) {
                    Ok(path) if path.is_file() => paths.push(path),
                    Ok(_) => {}
                    Err(e) => on_error(source_error(pattern.into(), e.into())),
                },
                Err(e) => {
                    let file = Utf8PathBuf::from(e.path().to_string_lossy().into_owned());
                    on_error(source_error(file, e.into()));
                }
            }
        }
        paths.sort();

        for origin in paths {
            if !seen.insert(origin.clone()) {
                continue;
            }

            let path = clean(&origin)
                .strip_prefix(&base)
                .map(Utf8Path::to_path_buf)
                .unwrap_or_else(|_| origin.file_name().unwrap_or(origin.as_str()).into());

            match fs::read(&origin) {
                Ok(data) => assets.push(Asset { path, origin, data }),
                Err(e) => on_error(source_error(origin, e.into())),
            }
        }
    }

    assets
}

fn clean(path: &Utf8Path) -> Utf8PathBuf {
    path.components()
        .filter(|c| !matches!(c, Utf8Component::CurDir))
        .collect()
}

fn source_error(file: Utf8PathBuf, source: anyhow::Error) -> TransformError {
    TransformError {
        stage: "source".into(),
        file,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_wildcard() {
        let (root, suffix) = split_glob("./images/img/raw/**/*");
        assert_eq!(root.as_str(), "images/img/raw");
        assert_eq!(suffix.as_str(), "**/*");
    }

    #[test]
    fn braces_are_literal() {
        let (root, suffix) = split_glob("img/{a,b}/*.png");
        assert_eq!(root.as_str(), "img/{a,b}");
        assert_eq!(suffix.as_str(), "*.png");
    }

    #[test]
    fn read_matches_brace_directories_literally() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        fs::create_dir_all(root.join("{a,b}")).unwrap();
        fs::write(root.join("{a,b}/x.png"), "x").unwrap();

        let assets = read(&[root.join("{a,b}/*.png").to_string()], |e| panic!("{e}"));
        let paths: Vec<_> = assets.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["x.png"]);
    }

    #[test]
    fn base_of_literal_file() {
        assert_eq!(glob_base("./assets/sass/main.scss").as_str(), "assets/sass");
        assert_eq!(glob_base("main.scss").as_str(), "");
    }

    #[test]
    fn base_of_wildcard() {
        assert_eq!(
            glob_base("build/script/vendor/**/*.js").as_str(),
            "build/script/vendor"
        );
    }

    #[test]
    fn read_keeps_relative_paths_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        fs::create_dir_all(root.join("raw/sub")).unwrap();
        fs::write(root.join("raw/b.txt"), "b").unwrap();
        fs::write(root.join("raw/sub/a.txt"), "a").unwrap();

        let globs = vec![
            root.join("raw/sub/*.txt").to_string(),
            root.join("raw/**/*").to_string(),
        ];
        let assets = read(&globs, |e| panic!("{e}"));

        let paths: Vec<_> = assets.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn read_empty_match() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let assets = read(&[root.join("missing/*.scss").to_string()], |e| panic!("{e}"));
        assert!(assets.is_empty());
    }
}
