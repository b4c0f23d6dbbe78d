#[cfg(test)]
mod tests {
    use gwflash::archive;
    use gwflash::config::{ComponentSpec, ConfigFormat, Layout, Profile};
    use gwflash::firmware::VersionSync;
    use gwflash::log::MemoryLog;
    use gwflash::SyncError;
    use mockito::{Server, ServerGuard};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn profile(root: &Path, manifest_url: String, layout: Layout, components: Vec<ComponentSpec>) -> Profile {
        Profile {
            layout,
            manifest_url,
            config_url: "http://127.0.0.1:9/unused".to_string(),
            config_format: ConfigFormat::Raw,
            key_suffix: String::new(),
            firmware_dir: root.join("firmware"),
            scratch_root: root.join("scratch"),
            components,
            archive: root.join("init.tar.gz"),
            package_root: root.to_path_buf(),
            package_dirs: vec![PathBuf::from("firmware")],
            install_script: root.join("install.sh"),
            remote_dir: "/tmpcf".to_string(),
            settings_dir: root.join("setting"),
            remote_config_path: "/tmp/settings.json".to_string(),
            package_settle_ms: 0,
        }
    }

    /// Release tarball whose top level holds `files`.
    fn release(files: &[(&str, &[u8])]) -> anyhow::Result<Vec<u8>> {
        let temp = TempDir::new()?;
        let content = temp.path().join("content");
        fs::create_dir_all(&content)?;
        for (name, data) in files {
            let path = content.join(name);
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(path, data)?;
        }
        let out = temp.path().join("release.tar.gz");
        archive::pack(&out, &content, &[PathBuf::from(".")])?;
        Ok(fs::read(out)?)
    }

    async fn serve_manifest(server: &mut ServerGuard, body: serde_json::Value) -> mockito::Mock {
        server
            .mock("GET", "/pkg")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await
    }

    fn sync(profile: Profile) -> (VersionSync, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new());
        (
            VersionSync::new(reqwest::Client::new(), Arc::new(profile), log.clone()),
            log,
        )
    }

    fn scratch_is_empty(root: &Path) -> bool {
        fs::read_dir(root.join("scratch"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_marker_absent_installs_remote_version() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut server = Server::new_async().await;
        let url = server.url();
        let manifest = serve_manifest(
            &mut server,
            serde_json::json!({
                "success": 1,
                "data": {"cgBox": {"version": 5, "url": format!("{url}/f.tar.gz")}}
            }),
        )
        .await;
        let download = server
            .mock("GET", "/f.tar.gz")
            .with_status(200)
            .with_body(release(&[("cgBox", b"box-v5"), ("conf/box.ini", b"[box]")])?)
            .expect(1)
            .create_async()
            .await;

        let (sync, log) = sync(profile(
            temp.path(),
            format!("{url}/pkg"),
            Layout::MarkerFile,
            vec![ComponentSpec::new("cgBox", "cgBox", "")],
        ));
        let report = sync.check_versions().await?;

        let firmware = temp.path().join("firmware");
        assert_eq!(fs::read_to_string(firmware.join("cgBox.version"))?, "5");
        assert_eq!(fs::read(firmware.join("cgBox"))?, b"box-v5");
        assert_eq!(fs::read(firmware.join("conf/box.ini"))?, b"[box]");
        assert_eq!(report.updated().count(), 1);
        assert_eq!(report.components[0].local, 0);
        assert_eq!(report.components[0].remote, 5);
        assert!(log.contains("No local version recorded for `cgBox`"));
        assert!(scratch_is_empty(temp.path()));
        manifest.assert_async().await;
        download.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_equal_versions_download_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let firmware = temp.path().join("firmware");
        fs::create_dir_all(&firmware)?;
        fs::write(firmware.join("cgBox.version"), "5")?;

        let mut server = Server::new_async().await;
        let url = server.url();
        serve_manifest(
            &mut server,
            serde_json::json!({
                "success": 1,
                "data": {"cgBox": {"version": 5, "url": format!("{url}/f.tar.gz")}}
            }),
        )
        .await;
        let download = server
            .mock("GET", "/f.tar.gz")
            .expect(0)
            .create_async()
            .await;

        let (sync, log) = sync(profile(
            temp.path(),
            format!("{url}/pkg"),
            Layout::MarkerFile,
            vec![ComponentSpec::new("cgBox", "cgBox", "")],
        ));
        let report = sync.check_versions().await?;

        assert!(report.is_up_to_date());
        assert!(log.contains("`cgBox` is up to date: 5"));
        download.assert_async().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_versioned_binary_upgrade_and_rollback() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let firmware = temp.path().join("firmware");
        fs::create_dir_all(&firmware)?;
        fs::write(firmware.join("cgService_3_parent"), b"svc-3")?;
        fs::write(firmware.join("cgManager_main_9_app"), b"mgr-9")?;

        let mut server = Server::new_async().await;
        let url = server.url();
        serve_manifest(
            &mut server,
            serde_json::json!({
                "success": 1,
                "data": {
                    "cgService": {"version": 4, "url": format!("{url}/svc.tar.gz")},
                    "cgManager": {"version": 8, "url": format!("{url}/mgr.tar.gz")}
                }
            }),
        )
        .await;
        server
            .mock("GET", "/svc.tar.gz")
            .with_body(release(&[("cgService", b"svc-4")])?)
            .create_async()
            .await;
        server
            .mock("GET", "/mgr.tar.gz")
            .with_body(release(&[("cgManager", b"mgr-8")])?)
            .create_async()
            .await;

        let (sync, _log) = sync(profile(
            temp.path(),
            format!("{url}/pkg"),
            Layout::VersionedBinary,
            vec![
                ComponentSpec::new("cgManager", "cgManager_main", "app"),
                ComponentSpec::new("cgService", "cgService", "parent"),
            ],
        ));
        let report = sync.check_versions().await?;

        assert_eq!(report.updated().count(), 2);
        assert!(!firmware.join("cgService_3_parent").exists());
        assert_eq!(fs::read(firmware.join("cgService_4_parent"))?, b"svc-4");
        // Lower remote version is installed like any other change
        assert!(!firmware.join("cgManager_main_9_app").exists());
        assert_eq!(fs::read(firmware.join("cgManager_main_8_app"))?, b"mgr-8");

        // Processed in configured order
        let names: Vec<&str> = report.components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cgManager", "cgService"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_first_failure_aborts_pass() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut server = Server::new_async().await;
        let url = server.url();
        serve_manifest(
            &mut server,
            serde_json::json!({
                "success": 1,
                "data": {
                    "cgService": {"version": 4, "url": format!("{url}/svc.tar.gz")},
                    "cgProtocol": {"version": 2, "url": format!("{url}/proto.tar.gz")}
                }
            }),
        )
        .await;
        server
            .mock("GET", "/svc.tar.gz")
            .with_status(404)
            .create_async()
            .await;
        let proto = server
            .mock("GET", "/proto.tar.gz")
            .expect(0)
            .create_async()
            .await;

        let (sync, _log) = sync(profile(
            temp.path(),
            format!("{url}/pkg"),
            Layout::VersionedBinary,
            vec![
                ComponentSpec::new("cgService", "cgService", "parent"),
                ComponentSpec::new("cgProtocol", "cgProtocol", "parent"),
            ],
        ));

        match sync.check_versions().await {
            Err(SyncError::DownloadFailed { component, reason }) => {
                assert_eq!(component, "cgService");
                assert!(reason.contains("404"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        proto.assert_async().await;
        assert!(scratch_is_empty(temp.path()));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_release_is_extract_failure() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut server = Server::new_async().await;
        let url = server.url();
        serve_manifest(
            &mut server,
            serde_json::json!({
                "data": {"cgBox": {"version": 2, "url": format!("{url}/f.tar.gz")}}
            }),
        )
        .await;
        server
            .mock("GET", "/f.tar.gz")
            .with_body("this is not a tarball")
            .create_async()
            .await;

        let (sync, _log) = sync(profile(
            temp.path(),
            format!("{url}/pkg"),
            Layout::MarkerFile,
            vec![ComponentSpec::new("cgBox", "cgBox", "")],
        ));
        let err = sync.check_versions().await.unwrap_err();
        assert!(matches!(err, SyncError::ExtractFailed { .. }), "{err}");

        // Marker untouched
        let marker = temp.path().join("firmware/cgBox.version");
        assert_eq!(fs::read_to_string(marker)?, "");
        Ok(())
    }

    #[tokio::test]
    async fn test_component_missing_from_manifest_is_skipped() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut server = Server::new_async().await;
        serve_manifest(&mut server, serde_json::json!({"success": 1, "data": {}})).await;

        let (sync, log) = sync(profile(
            temp.path(),
            format!("{}/pkg", server.url()),
            Layout::VersionedBinary,
            vec![ComponentSpec::new("cgProtocol", "cgProtocol", "parent")],
        ));
        let report = sync.check_versions().await?;

        assert!(report.components.is_empty());
        assert_eq!(report.missing, vec!["cgProtocol"]);
        assert!(log.contains("missing from the manifest"));
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_failure() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/pkg")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let (sync, _log) = sync(profile(
            temp.path(),
            format!("{}/pkg", server.url()),
            Layout::MarkerFile,
            vec![ComponentSpec::new("cgBox", "cgBox", "")],
        ));
        let err = sync.check_versions().await.unwrap_err();
        assert!(matches!(err, SyncError::ManifestFetchFailed(_)));
        assert!(scratch_is_empty(temp.path()));
        Ok(())
    }
}
