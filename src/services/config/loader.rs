//! Reading, synthesizing and persisting the root configuration.

use rand::Rng;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::env;
use super::types::{DatabaseKind, DbConfig, RootConfig};
use crate::error::{Error, Result};

/// Length of synthesized passwords.
pub const PASSWORD_LEN: usize = 40;

const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Format::Yaml
            }
            _ => Format::Json,
        }
    }
}

/// Random password drawn from `[A-Za-z0-9_-]`.
pub fn generate_password(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// The single-PostgreSQL config written on first run.
pub fn default_root(path: &Path) -> RootConfig {
    let mut db = DbConfig::new(Uuid::new_v4().to_string(), DatabaseKind::Postgres);
    db.name = env::APP_NAME.to_string();
    db.is_default = true;
    db.enabled = Some(true);
    db.host = "127.0.0.1".to_string();
    db.port = Some(5432);
    db.user = env::DEFAULT_ADMIN.to_string();
    db.pass = generate_password(PASSWORD_LEN);
    db.db_name = env::DEFAULT_DB_NAME.to_string();
    db.schema = "public".to_string();
    for (key, value) in [
        ("sslmode", "disable"),
        ("max_connections", "50"),
        ("connect_timeout", "10"),
        ("application_name", env::APP_NAME),
        ("pool_max_lifetime", "30m"),
    ] {
        db.options.insert(key.to_string(), value.to_string());
    }
    db.dsn = db.build_dsn().ok();

    let mut root = RootConfig::new(env::APP_NAME, vec![db]);
    root.file_path = path.to_path_buf();
    root
}

/// Load the config at `path`, or synthesize and persist the default one.
///
/// An empty path falls back to [`env::default_config_path`].
pub async fn load_or_bootstrap(path: impl AsRef<Path>) -> Result<RootConfig> {
    let path = resolve_path(path.as_ref())?;

    match async_fs::read(&path).await {
        Ok(bytes) => {
            let mut root = decode(&path, &bytes)?;
            root.file_path = path.clone();
            root.validate()?;

            if assign_missing_ids(&mut root) {
                tracing::info!(path = %path.display(), "assigned ids to databases, writing back");
                save(&root).await?;
            }
            Ok(root)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config found, writing default PostgreSQL config");
            let root = default_root(&path);
            save(&root).await?;
            Ok(root)
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "config not readable");
            Err(Error::ConfigNotFound { path })
        }
    }
}

/// Load an existing config; a missing file is `ConfigNotFound`.
pub async fn load(path: impl AsRef<Path>) -> Result<RootConfig> {
    let path = resolve_path(path.as_ref())?;
    let bytes = async_fs::read(&path)
        .await
        .map_err(|_| Error::ConfigNotFound { path: path.clone() })?;
    let mut root = decode(&path, &bytes)?;
    root.file_path = path;
    root.validate()?;
    Ok(root)
}

/// Persist `root` at its `file_path`.
///
/// The bytes land in a sibling temp file first and are renamed over the
/// target, so a crash never leaves a truncated config behind.
pub async fn save(root: &RootConfig) -> Result<()> {
    if root.file_path.as_os_str().is_empty() {
        return Err(Error::ConfigNotFound {
            path: PathBuf::new(),
        });
    }
    let path = &root.file_path;
    let bytes = encode(path, root)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_private_dir(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let written = async {
        async_fs::write(&tmp, &bytes).await?;
        set_private_mode(&tmp).await?;
        async_fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = written {
        let _ = async_fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    tracing::debug!(path = %path.display(), "config saved");
    Ok(())
}

fn resolve_path(path: &Path) -> Result<PathBuf> {
    let path = if path.as_os_str().is_empty() {
        env::default_config_path()?
    } else {
        path.to_path_buf()
    };
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<RootConfig> {
    match Format::for_path(path) {
        Format::Json => serde_json::from_slice(bytes).map_err(|e| Error::config_parse(path, e)),
        Format::Yaml => serde_yaml::from_slice(bytes).map_err(|e| Error::config_parse(path, e)),
    }
}

fn encode(path: &Path, root: &RootConfig) -> Result<Vec<u8>> {
    match Format::for_path(path) {
        Format::Json => serde_json::to_vec_pretty(root).map_err(|e| Error::config_parse(path, e)),
        Format::Yaml => serde_yaml::to_string(root)
            .map(String::into_bytes)
            .map_err(|e| Error::config_parse(path, e)),
    }
}

fn assign_missing_ids(root: &mut RootConfig) -> bool {
    let mut changed = false;
    for db in root.databases.iter_mut().filter(|db| db.id.trim().is_empty()) {
        db.id = Uuid::new_v4().to_string();
        changed = true;
    }
    changed
}

async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = async_fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use async_fs::unix::DirBuilderExt;
        builder.mode(0o750);
    }
    builder.create(dir).await
}

async fn set_private_mode(file: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        async_fs::set_permissions(file, std::fs::Permissions::from_mode(0o640)).await?;
    }
    #[cfg(not(unix))]
    let _ = file;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_password_alphabet() {
        let password = generate_password(PASSWORD_LEN);
        assert_eq!(password.len(), 40);
        assert!(
            password
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        );
        assert_ne!(password, generate_password(PASSWORD_LEN));
    }

    #[test]
    fn test_default_root_shape() {
        let root = default_root(Path::new("/tmp/kubexdb/config.json"));
        assert_eq!(root.databases.len(), 1);
        let db = &root.databases[0];
        assert_eq!(db.kind, DatabaseKind::Postgres);
        assert!(db.is_default);
        assert_eq!(db.port, Some(5432));
        assert_eq!(db.schema, "public");
        assert_eq!(db.option("pool_max_lifetime"), Some("30m"));
        assert_eq!(db.option("max_connections"), Some("50"));
        let dsn = db.dsn().unwrap();
        assert!(dsn.starts_with("postgres://kubexdb:"));
        assert!(dsn.ends_with("@127.0.0.1:5432/kubexdb?sslmode=disable"));
    }

    #[test]
    fn test_bootstrap_writes_default_file() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("fresh").join("config.json");

            let root = load_or_bootstrap(&path).await.unwrap();
            assert!(path.exists());
            assert_eq!(root.file_path, path);
            assert_eq!(root.databases[0].pass.len(), PASSWORD_LEN);

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = std::fs::metadata(&path).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o640);
                let dir_mode = std::fs::metadata(path.parent().unwrap())
                    .unwrap()
                    .permissions()
                    .mode();
                assert_eq!(dir_mode & 0o777, 0o750);
            }

            // second call reads what the first wrote
            let again = load_or_bootstrap(&path).await.unwrap();
            assert_eq!(again, root);
        });
    }

    #[test]
    fn test_save_load_round_trip_json_and_yaml() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            for file in ["config.json", "config.yaml"] {
                let path = dir.path().join(file);
                let mut root = default_root(&path);
                let mut redis = DbConfig::new("cache", DatabaseKind::Redis);
                redis.enabled = Some(false);
                redis.options.insert("volume".into(), "/srv/redis".into());
                root.databases.push(redis);

                save(&root).await.unwrap();
                let loaded = load(&path).await.unwrap();
                assert_eq!(loaded, root, "{file}");
            }
        });
    }

    #[test]
    fn test_missing_ids_are_assigned_and_persisted() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("config.json");
            std::fs::write(
                &path,
                r#"{"name":"stack","databases":[{"type":"postgres","user":"u","db_name":"d"}]}"#,
            )
            .unwrap();

            let first = load_or_bootstrap(&path).await.unwrap();
            let id = first.databases[0].id.clone();
            assert!(!id.is_empty());

            let second = load_or_bootstrap(&path).await.unwrap();
            assert_eq!(second.databases[0].id, id);
        });
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("config.json");
            std::fs::write(&path, b"{ not json").unwrap();
            assert!(matches!(
                load_or_bootstrap(&path).await,
                Err(Error::ConfigParse { .. })
            ));
        });
    }

    #[test]
    fn test_load_missing_file() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let result = load(dir.path().join("absent.json")).await;
            assert!(matches!(result, Err(Error::ConfigNotFound { .. })));
        });
    }
}
