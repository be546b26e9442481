//! Runtime startup and shutdown tests.

mod common;

use common::TestCerts;
use keel::runtime::Runtime;

fn paths(files: &(tempfile::NamedTempFile, tempfile::NamedTempFile)) -> (String, String) {
    (
        files.0.path().display().to_string(),
        files.1.path().display().to_string(),
    )
}

#[tokio::test]
async fn runtime_serves_and_stops() {
    let certs = TestCerts::generate();
    let files = certs.write();
    let (cert, key) = paths(&files);
    let config = common::load_config(&common::config_toml(&cert, &key, ""));

    let mut runtime = Runtime::new(config).unwrap();
    assert!(!runtime.is_running());
    runtime.start().await.unwrap();
    assert!(runtime.is_running());

    let addr = runtime.local_addr().unwrap();
    let client = keel::Client::connect(addr, "localhost", certs.cert_pem.as_bytes())
        .await
        .unwrap();
    let info = client
        .login("user-admin", common::ADMIN_PASSWORD)
        .await
        .unwrap();
    assert_eq!(info.environment, common::ENV_UUID);
    client.ping().await.unwrap();
    client.close().await;

    runtime.stop().await.unwrap();
    assert!(!runtime.is_running());
    assert!(runtime.local_addr().is_none());
}

#[tokio::test]
async fn run_returns_after_shutdown_request() {
    let certs = TestCerts::generate();
    let files = certs.write();
    let (cert, key) = paths(&files);
    let config = common::load_config(&common::config_toml(&cert, &key, ""));

    let mut runtime = Runtime::new(config).unwrap();
    let shutdown = runtime.shutdown_receiver();
    runtime.shutdown();
    tokio::time::timeout(std::time::Duration::from_secs(5), runtime.run())
        .await
        .unwrap()
        .unwrap();
    assert!(*shutdown.borrow());
    assert!(!runtime.is_running());
}

#[tokio::test]
async fn journal_environment_persists_across_restarts() {
    let certs = TestCerts::generate();
    let files = certs.write();
    let (cert, key) = paths(&files);
    let data = tempfile::tempdir().unwrap();
    let extra = format!(
        "\n[store]\nbackend = \"journal\"\ndata_dir = \"{}\"\n",
        data.path().join("journal").display()
    );

    let config = common::load_config(&common::config_toml(&cert, &key, &extra));
    let mut runtime = Runtime::new(config.clone()).unwrap();
    runtime.start().await.unwrap();
    let st = runtime.state().unwrap().clone();
    st.add_service("mysql", "cs:mysql-1", &[]).unwrap();
    runtime.stop().await.unwrap();
    drop(st);

    // The password is only needed to create the environment.
    let mut restarted_config = config;
    restarted_config.environment.admin_password = None;
    let mut runtime = Runtime::new(restarted_config).unwrap();
    runtime.start().await.unwrap();
    let st = runtime.state().unwrap();
    assert_eq!(st.service("mysql").unwrap().charm_url(), "cs:mysql-1");
    st.authenticate("user-admin", common::ADMIN_PASSWORD).unwrap();
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn first_start_requires_admin_password() {
    let certs = TestCerts::generate();
    let files = certs.write();
    let (cert, key) = paths(&files);
    let mut config = common::load_config(&common::config_toml(&cert, &key, ""));
    config.environment.admin_password = None;

    let mut runtime = Runtime::new(config).unwrap();
    let err = runtime.start().await.unwrap_err();
    assert!(format!("{:#}", err).contains("admin_password"), "{:#}", err);
    assert!(!runtime.is_running());
}

#[tokio::test]
async fn missing_certificate_fails_start() {
    let config = common::load_config(&common::config_toml(
        "/nonexistent/server.crt",
        "/nonexistent/server.key",
        "",
    ));
    let mut runtime = Runtime::new(config).unwrap();
    let err = runtime.start().await.unwrap_err();
    assert!(format!("{:#}", err).contains("cert chain"), "{:#}", err);
}
