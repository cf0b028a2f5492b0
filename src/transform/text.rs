use camino::Utf8PathBuf;

use crate::config::LineEnding;
use crate::pipeline::{Asset, Combine, Transform};

/// Rewrites the file name of an asset, keeping its directory.
///
/// `Rename::suffix(".min")` turns `css/main.css` into `css/main.min.css`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rename {
    pub basename: Option<String>,
    pub suffix: String,
    pub extension: Option<String>,
}

impl Rename {
    pub fn suffix(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            ..Self::default()
        }
    }

    pub fn basename(mut self, basename: impl Into<String>) -> Self {
        self.basename = Some(basename.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }
}

impl Transform for Rename {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn params(&self) -> String {
        format!("{:?}", self)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let stem = match &self.basename {
            Some(basename) => basename.as_str(),
            None => asset.path.file_stem().unwrap_or_default(),
        };
        let extension = match &self.extension {
            Some(extension) => Some(extension.as_str()),
            None => asset.path.extension(),
        };

        let mut file = format!("{stem}{}", self.suffix);
        if let Some(extension) = extension.filter(|e| !e.is_empty()) {
            file.push('.');
            file.push_str(extension.trim_start_matches('.'));
        }

        let path = match asset.path.parent() {
            Some(parent) => parent.join(file),
            None => Utf8PathBuf::from(file),
        };

        Ok(asset.with_path(path))
    }
}

/// Normalizes every line terminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineEndings(pub LineEnding);

impl Transform for LineEndings {
    fn name(&self) -> &'static str {
        "line-endings"
    }

    fn params(&self) -> String {
        format!("{:?}", self.0)
    }

    fn apply(&self, asset: Asset) -> anyhow::Result<Asset> {
        let text = normalize(asset.text()?, self.0);
        Ok(asset.with_text(text))
    }
}

pub(crate) fn normalize(text: &str, ending: LineEnding) -> String {
    let lf = text.replace("\r\n", "\n").replace('\r', "\n");

    match ending {
        LineEnding::Lf => lf,
        LineEnding::CrLf => lf.replace('\n', "\r\n"),
    }
}

/// Joins every input into a single file, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concat {
    pub file: Utf8PathBuf,
    pub separator: String,
}

impl Concat {
    pub fn new(file: impl Into<Utf8PathBuf>) -> Self {
        Self {
            file: file.into(),
            separator: "\n".into(),
        }
    }
}

impl Combine for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn combine(&self, assets: Vec<Asset>) -> anyhow::Result<Asset> {
        let mut data = Vec::new();

        for (i, asset) in assets.into_iter().enumerate() {
            if i > 0 && !data.ends_with(self.separator.as_bytes()) {
                data.extend_from_slice(self.separator.as_bytes());
            }
            data.extend(asset.data);
        }

        Ok(Asset::new(self.file.clone(), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_adds_suffix() {
        let asset = Rename::suffix(".min")
            .apply(Asset::new("css/main.css", ""))
            .unwrap();
        assert_eq!(asset.path.as_str(), "css/main.min.css");
    }

    #[test]
    fn rename_everything() {
        let asset = Rename::suffix("-v2")
            .basename("app")
            .extension(".js")
            .apply(Asset::new("main.ts", ""))
            .unwrap();
        assert_eq!(asset.path.as_str(), "app-v2.js");
    }

    #[test]
    fn rename_without_extension() {
        let asset = Rename::suffix(".min").apply(Asset::new("LICENSE", "")).unwrap();
        assert_eq!(asset.path.as_str(), "LICENSE.min");
    }

    #[test]
    fn line_endings() {
        assert_eq!(normalize("a\r\nb\rc\n", LineEnding::Lf), "a\nb\nc\n");
        assert_eq!(normalize("a\r\nb\n", LineEnding::CrLf), "a\r\nb\r\n");
    }

    #[test]
    fn concat_in_order() {
        let bundle = Concat::new("app.js")
            .combine(vec![
                Asset::new("a.js", "let a;\n"),
                Asset::new("b.js", "let b;"),
                Asset::new("c.js", "let c;"),
            ])
            .unwrap();

        assert_eq!(bundle.path.as_str(), "app.js");
        assert_eq!(bundle.text().unwrap(), "let a;\nlet b;\nlet c;");
    }
}
