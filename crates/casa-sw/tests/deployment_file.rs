//! Deployment files are read as written, whatever the host environment pins.

use casa_sw::{FileScriptSource, ScriptSource};
use url::Url;

#[tokio::test]
async fn cache_version_override_does_not_mask_new_builds() {
    std::env::set_var("CASA_CACHE_VERSION", "pinned");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deployment.json");
    let script = Url::parse("https://casas.example/service-worker.js").unwrap();
    let source = FileScriptSource::new(&path);

    std::fs::write(
        &path,
        r#"{"worker": {"origin": "https://casas.example/", "version": "v1"}}"#,
    )
    .unwrap();
    assert_eq!(source.load(&script).await.unwrap().version, "v1");

    std::fs::write(
        &path,
        r#"{"worker": {"origin": "https://casas.example/", "version": "v2"}}"#,
    )
    .unwrap();
    let build = source.load(&script).await.unwrap();
    assert_eq!(build.version, "v2");
    assert_eq!(build.cache_name(), "casa-cache-v2");

    std::env::remove_var("CASA_CACHE_VERSION");
}
