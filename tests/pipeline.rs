use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use image::{ImageBuffer, Rgb};
use nagare::engine::reload::{Reloader, Signal};
use nagare::notifier::Recorder;
use nagare::pipeline::{Asset, Cache, Op, Pipeline, Transform};
use nagare::transform::{Minify, OptimizeImage, Sass, targets};
use nagare::{Blueprint, BlueprintError, Config, Environment, Settings, tasks};
use tempfile::TempDir;

const MAIN_SCSS: &str = r#"
.a { color: red; }
@media (max-width: 500px) { .a { color: blue; } }
.b { color: green; }
@media (max-width: 500px) { .b { color: black; } }
"#;

fn scratch() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn settings(root: &Utf8Path) -> Settings {
    settings_with(root, "")
}

fn settings_with(root: &Utf8Path, extra: &str) -> Settings {
    let config = Config::from_toml(&format!(
        r#"
        style_src = "{root}/sass/main.scss"
        style_destination = "{root}/css"
        img_src = "{root}/img/**/*"
        img_dst = "{root}/out/img"
        watch_styles = "{root}/sass/**/*.scss"
        cache_dir = "{root}/cache"
        {extra}
        "#
    ))
    .unwrap();

    Settings::from_config(&config).unwrap()
}

fn write_main_scss(root: &Utf8Path) {
    fs::create_dir_all(root.join("sass")).unwrap();
    fs::write(root.join("sass/main.scss"), MAIN_SCSS).unwrap();
}

fn env(settings: Settings) -> (Environment, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let env = Environment::offline(settings).with_notifier(recorder.clone());
    (env, recorder)
}

fn write_png(path: &Utf8Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = ImageBuffer::from_fn(32, 32, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 128]));
    img.save(path).unwrap();
}

#[test]
fn empty_source_writes_nothing() {
    let (_dir, root) = scratch();
    let (env, recorder) = env(settings(&root));

    let report = tasks::styles(&env.settings).unwrap().run(&env);

    assert!(report.written.is_empty());
    assert_eq!(report.failed, 0);
    assert!(recorder.failures().is_empty());
    assert!(!root.join("css").exists());
}

#[test]
fn styles_merge_media_in_both_outputs() {
    let (_dir, root) = scratch();
    fs::create_dir_all(root.join("sass")).unwrap();
    fs::write(root.join("sass/main.scss"), MAIN_SCSS).unwrap();

    let (env, recorder) = env(settings(&root));
    let report = tasks::styles(&env.settings).unwrap().run(&env);

    assert_eq!(report.failed, 0, "{:?}", recorder.failures());
    assert_eq!(
        report.written,
        vec![root.join("css/main.css"), root.join("css/main.min.css")]
    );

    let css = fs::read_to_string(root.join("css/main.css")).unwrap();
    let min = fs::read_to_string(root.join("css/main.min.css")).unwrap();

    assert_eq!(css.matches("@media").count(), 1);
    assert!(css.find(".b").unwrap() < css.find("@media").unwrap());
    assert_eq!(min.matches("@media").count(), 1);
    assert!(min.contains(".a{color:red}"));
}

#[test]
fn minified_sibling_is_a_minification_of_the_plain_output() {
    let (_dir, root) = scratch();
    fs::create_dir_all(root.join("sass")).unwrap();
    fs::write(root.join("sass/main.scss"), MAIN_SCSS).unwrap();

    let (env, _) = env(settings(&root));
    tasks::styles(&env.settings).unwrap().run(&env);

    let css = fs::read_to_string(root.join("css/main.css")).unwrap();
    let min = fs::read_to_string(root.join("css/main.min.css")).unwrap();

    let again = Minify::default().apply(Asset::new("main.css", css)).unwrap();
    assert_eq!(again.text().unwrap(), min);
}

#[test]
fn media_queries_keep_the_syntax_of_the_browser_targets() {
    let (_dir, root) = scratch();
    write_main_scss(&root);

    let settings = settings_with(&root, r#"browsers_list = ["ie >= 11", "safari 13"]"#);
    let targets = targets("minify", &settings.browsers).unwrap();
    let (env, recorder) = env(settings);
    let report = tasks::styles(&env.settings).unwrap().run(&env);
    assert_eq!(report.failed, 0, "{:?}", recorder.failures());

    let css = fs::read_to_string(root.join("css/main.css")).unwrap();
    let min = fs::read_to_string(root.join("css/main.min.css")).unwrap();

    assert_eq!(css.matches("@media").count(), 1);
    assert!(css.contains("max-width"), "{css}");
    assert!(!css.contains("width <="), "{css}");
    assert!(min.contains("max-width"), "{min}");

    let again = Minify::new(targets, None)
        .apply(Asset::new("main.css", css))
        .unwrap();
    assert_eq!(again.text().unwrap(), min);
}

#[test]
fn one_styles_run_sends_one_signal() {
    let (_dir, root) = scratch();
    write_main_scss(&root);

    let (reload, signals) = Reloader::channel(true);
    let (env, _) = env(settings(&root));
    let env = env.with_reloader(reload);

    tasks::styles(&env.settings).unwrap().run(&env);

    let received: Vec<_> = signals.try_iter().collect();
    assert_eq!(received.len(), 1, "{received:?}");
    match &received[0] {
        Signal::Inject { paths } => {
            assert_eq!(paths.len(), 2);
            assert!(paths[0].ends_with("css/main.css"));
            assert!(paths[1].ends_with("css/main.min.css"));
        }
        other => panic!("expected an injection, got {other:?}"),
    }
}

#[test]
fn reruns_are_idempotent() {
    let (_dir, root) = scratch();
    fs::create_dir_all(root.join("sass")).unwrap();
    fs::write(root.join("sass/main.scss"), MAIN_SCSS).unwrap();

    let (env, _) = env(settings(&root));
    let pipeline = tasks::styles(&env.settings).unwrap();

    pipeline.run(&env);
    let first = fs::read(root.join("css/main.min.css")).unwrap();
    pipeline.run(&env);
    let second = fs::read(root.join("css/main.min.css")).unwrap();

    assert_eq!(first, second);
}

#[test]
fn sass_errors_are_reported_per_file() {
    let (_dir, root) = scratch();
    fs::create_dir_all(root.join("sass")).unwrap();
    fs::write(root.join("sass/ok.scss"), ".ok { color: red; }").unwrap();
    fs::write(root.join("sass/broken.scss"), ".broken { color: ").unwrap();

    let (env, recorder) = env(settings(&root));
    let pipeline = Pipeline::builder("sass")
        .source(format!("{root}/sass/*.scss"))
        .stage("sass", Op::map(Sass::default()))
        .write(root.join("out"))
        .build()
        .unwrap();

    let report = pipeline.run(&env);

    assert_eq!(report.failed, 1);
    assert_eq!(report.written, vec![root.join("out/ok.css")]);
    assert_eq!(recorder.failures().len(), 1);
    assert!(recorder.failures()[0].contains("broken.scss"));
}

#[test]
fn cached_images_match_fresh_results() {
    let (_dir, root) = scratch();
    write_png(&root.join("img/photo.png"));

    let (env, _) = env(settings(&root));
    let pipeline = tasks::images(&env.settings).unwrap();
    let output = root.join("out/img/photo.png");

    pipeline.run(&env);
    let fresh = fs::read(&output).unwrap();
    fs::remove_file(&output).unwrap();

    pipeline.run(&env);
    let cached = fs::read(&output).unwrap();

    assert_eq!(fresh, cached);
    assert_eq!(env.cache.stats().hits, 1);
    assert_eq!(env.cache.stats().misses, 1);
}

#[test]
fn changed_parameters_miss_the_cache() {
    let (_dir, root) = scratch();
    write_png(&root.join("img/photo.png"));

    let (env, _) = env(settings(&root));
    let build = |quality| {
        Pipeline::builder("images")
            .source(format!("{root}/img/**/*"))
            .stage("optimize", Op::cached(OptimizeImage::new(quality)))
            .write(root.join("out/img"))
            .build()
            .unwrap()
    };

    build(85).run(&env);
    build(60).run(&env);

    assert_eq!(env.cache.stats().hits, 0);
    assert_eq!(env.cache.stats().misses, 2);
}

#[test]
fn persistent_cache_survives_the_process() {
    let (_dir, root) = scratch();
    write_png(&root.join("img/photo.png"));
    let settings = settings(&root);

    let run = || {
        let cache = Arc::new(Cache::persistent(root.join("cache")));
        let (env, _) = env(settings.clone());
        let env = env.with_cache(cache.clone());
        tasks::images(&env.settings).unwrap().run(&env);
        cache.stats()
    };

    assert_eq!(run().misses, 1);
    assert_eq!(run().hits, 1);
}

#[test]
fn dependency_cycle_is_detected_before_running() {
    let (_dir, root) = scratch();
    let runs = Arc::new(AtomicUsize::new(0));

    let detect = || {
        let mut blueprint = Blueprint::new();
        for (name, dep) in [("a", "b"), ("b", "a")] {
            let runs = runs.clone();
            blueprint.task(name).depends_on(dep).run(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let (env, _) = env(settings(&root));
        match blueprint.finish(env).err() {
            Some(BlueprintError::Cycle(cycle)) => cycle.task,
            other => panic!("expected a cycle, got {other:?}"),
        }
    };

    assert_eq!(detect(), detect());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn standard_tasks_form_a_valid_graph() {
    let (_dir, root) = scratch();
    let settings = settings(&root);
    let blueprint = tasks::blueprint(&settings).unwrap();
    let (env, _) = env(settings);

    let scheduler = blueprint.finish(env).unwrap();
    let graph = scheduler.to_string();

    assert!(graph.starts_with("graph LR"));
    assert!(graph.contains("default (parallel)"));
}
