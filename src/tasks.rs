//! The standard front-end build: styles, images, icons, scripts, a dev
//! server and a watcher, all driven by [`Settings`].

use crate::config::Settings;
use crate::engine::{Blueprint, WatchBinding};
use crate::error::PipelineError;
use crate::pipeline::{Effect, Op, Pipeline};
use crate::transform::{
    Autoprefix, Concat, GlobImports, LineEndings, MergeMediaQueries, Minify, OptimizeImage, Rename,
    Sass, Sprite, StripComments, Symbolize, targets,
};

/// Builds every standard task.
///
/// `default` runs `styles`, `images`, `serve` and `watch` in parallel.
pub fn blueprint(settings: &Settings) -> Result<Blueprint, PipelineError> {
    let mut blueprint = Blueprint::new();

    blueprint
        .pipeline(styles(settings)?)
        .pipeline(images(settings)?)
        .pipeline(icons(settings)?)
        .pipeline(scripts(settings)?);

    blueprint.task("serve").run(|env| {
        let reload_port = env.start_live_reload()?;
        if let Some(port) = reload_port {
            tracing::info!("live reload listening on port {port}");
        }

        #[cfg(feature = "server")]
        crate::engine::serve(env, reload_port)?;

        Ok(())
    });

    blueprint
        .watch("watch", watch_bindings(settings))
        .parallel("default", ["styles", "images", "serve", "watch"]);

    Ok(blueprint)
}

/// Sass → plain CSS, merged media queries, then a minified sibling.
pub fn styles(settings: &Settings) -> Result<Pipeline, PipelineError> {
    let targets = targets("autoprefix", &settings.browsers)?;

    Pipeline::builder("styles")
        .sources(&settings.style_src)
        .stage("glob-imports", Op::map(GlobImports))
        .stage("sass", Op::map(Sass::new(settings.output_style, settings.precision)))
        .stage("strip-comments", Op::map(StripComments))
        .stage("autoprefix", Op::map(Autoprefix::new(targets)))
        .stage("css-only", Op::Filter("*.css".into()))
        .stage("merge-media", Op::map(MergeMediaQueries::new(targets)))
        .write(&settings.style_destination)
        .emit(Effect::Inject)
        .branch("rename", "merge-media", Op::map(Rename::suffix(".min")))
        .stage("minify", Op::map(Minify::new(targets, settings.max_line_len)))
        .stage("line-endings", Op::map(LineEndings(settings.line_ending)))
        .write(&settings.style_destination)
        .emit(Effect::Inject)
        .build()
}

pub fn images(settings: &Settings) -> Result<Pipeline, PipelineError> {
    Pipeline::builder("images")
        .sources(&settings.img_src)
        .stage("optimize", Op::cached(OptimizeImage::new(settings.jpeg_quality)))
        .write(&settings.img_dst)
        .build()
}

/// Every SVG icon optimized and folded into one sprite.
pub fn icons(settings: &Settings) -> Result<Pipeline, PipelineError> {
    Pipeline::builder("icons")
        .sources(&settings.icon_src)
        .stage("svg-only", Op::Filter("*.svg".into()))
        .stage("optimize", Op::cached(OptimizeImage::new(settings.jpeg_quality)))
        .stage(
            "symbolize",
            Op::map(Symbolize {
                strip_fill: settings.icon_strip_fill,
            }),
        )
        .stage(
            "sprite",
            Op::combine(Sprite::new(format!("{}.svg", settings.icon_sprite_file))),
        )
        .write(&settings.icon_dst)
        .build()
}

/// Vendor scripts first, then custom ones, joined into a single bundle.
pub fn scripts(settings: &Settings) -> Result<Pipeline, PipelineError> {
    Pipeline::builder("scripts")
        .sources(&settings.js_vendor_src)
        .sources(&settings.js_custom_src)
        .stage(
            "concat",
            Op::combine(Concat::new(format!("{}.js", settings.js_custom_file))),
        )
        .stage("line-endings", Op::map(LineEndings(settings.line_ending)))
        .write(&settings.js_custom_destination)
        .build()
}

fn watch_bindings(settings: &Settings) -> Vec<WatchBinding> {
    let mut bindings = vec![
        WatchBinding::new(&settings.watch_styles).run("styles"),
        WatchBinding::new(&settings.img_src).run("images").reload(),
    ];

    if !settings.icon_src.is_empty() {
        bindings.push(WatchBinding::new(&settings.icon_src).run("icons").reload());
    }

    let scripts: Vec<_> = settings
        .watch_js_vendor
        .iter()
        .chain(&settings.watch_js_custom)
        .collect();
    if !scripts.is_empty() {
        bindings.push(WatchBinding::new(scripts).run("scripts").reload());
    }

    if !settings.watch_templates.is_empty() {
        bindings.push(WatchBinding::new(&settings.watch_templates).reload());
    }

    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Environment;
    use crate::config::Config;

    fn settings() -> Settings {
        Settings::from_config(&Config::builtin()).unwrap()
    }

    #[test]
    fn standard_blueprint_is_valid() {
        let settings = settings();
        let scheduler = blueprint(&settings)
            .unwrap()
            .finish(Environment::offline(settings))
            .unwrap();

        for name in ["styles", "images", "icons", "scripts", "serve", "watch", "default"] {
            assert!(scheduler.contains(name), "missing task {name}");
        }
    }

    #[test]
    fn styles_writes_both_chains() {
        let pipeline = styles(&settings()).unwrap();
        let written: Vec<_> = pipeline
            .stages()
            .filter(|stage| stage.dest.is_some())
            .map(|stage| stage.name.as_str())
            .collect();

        assert_eq!(written, ["merge-media", "line-endings"]);
    }

    #[test]
    fn watch_covers_every_source() {
        let bindings = watch_bindings(&settings());
        let tasks: Vec<_> = bindings.iter().flat_map(|b| b.tasks.iter()).collect();

        assert_eq!(tasks, ["styles", "images", "icons", "scripts"]);
        // templates only reload
        assert!(bindings.last().unwrap().tasks.is_empty());
        assert!(!bindings[0].reload);
    }
}
