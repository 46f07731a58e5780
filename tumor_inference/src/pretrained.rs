//! Pretrained ResNet-18 backbone used to seed bootstrapped models.

use crate::config::ModelConfig;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const PARTIAL_SUFFIX: &str = ".part";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to download {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Local backbone weights for a bootstrap, downloaded from `backbone_url` the first time they
/// are needed. `None` leaves the backbone randomly initialized.
pub fn resolve_backbone(config: &ModelConfig) -> Option<PathBuf> {
    let path = config.backbone_path();
    if path.exists() {
        return Some(path);
    }

    let Some(url) = config.backbone_url.as_deref() else {
        tracing::warn!(
            "Pretrained backbone {:?} not found and no backbone_url configured",
            path
        );
        return None;
    };

    tracing::info!("Downloading pretrained backbone from {} to {:?}", url, path);
    match fetch_backbone(url, &path) {
        Ok(bytes) => {
            tracing::info!("Downloaded {} bytes of backbone weights", bytes);
            Some(path)
        }
        Err(e) => {
            tracing::warn!("Could not download the pretrained backbone: {}", e);
            None
        }
    }
}

/// Streams `url` into a `.part` sibling of `dest` and renames it into place once complete.
pub fn fetch_backbone(url: &str, dest: &Path) -> Result<u64, FetchError> {
    let http_error = |source| FetchError::Http {
        url: url.to_string(),
        source,
    };

    let mut response = client()
        .and_then(|client| client.get(url).send())
        .and_then(|response| response.error_for_status())
        .map_err(http_error)?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|source| FetchError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let partial = partial_path(dest);
    let written = File::create(&partial)
        .map_err(|source| FetchError::Io {
            path: partial.clone(),
            source,
        })
        .and_then(|mut file| response.copy_to(&mut file).map_err(http_error));
    let written = match written {
        Ok(written) => written,
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
    };

    std::fs::rename(&partial, dest).map_err(|source| FetchError::Io {
        path: dest.to_path_buf(),
        source,
    })?;

    Ok(written)
}

fn client() -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(format!("tumor-inference/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpListener,
    };

    /// Serves a single HTTP response on a local port and returns the url to request.
    /// Later connections are refused.
    pub fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 && line != "\r\n" {
                line.clear();
            }

            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(&body).unwrap();
        });

        format!("http://{address}/resnet18.safetensors")
    }

    /// Url on a local port nothing listens on.
    pub fn unreachable_url() -> String {
        let address = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        format!("http://{address}/resnet18.safetensors")
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::*, *};
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tumor-pretrained-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_fetch_writes_body_into_place() {
        let dir = temp_dir();
        let dest = dir.join("model_files").join("resnet18_backbone.safetensors");
        let url = serve_once("200 OK", b"backbone bytes".to_vec());

        let written = fetch_backbone(&url, &dest).unwrap();

        assert_eq!(written, 14);
        assert_eq!(std::fs::read(&dest).unwrap(), b"backbone bytes");
        assert!(!partial_path(&dest).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_fetch_rejects_error_status() {
        let dir = temp_dir();
        let dest = dir.join("resnet18_backbone.safetensors");
        let url = serve_once("404 Not Found", b"missing".to_vec());

        let result = fetch_backbone(&url, &dest);

        assert!(matches!(result, Err(FetchError::Http { .. })));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_existing_backbone_is_not_downloaded() {
        let dir = temp_dir();
        let mut config = ModelConfig::new(&dir);
        config.backbone_url = Some(unreachable_url());
        std::fs::write(config.backbone_path(), b"cached").unwrap();

        assert_eq!(resolve_backbone(&config), Some(config.backbone_path()));
        assert_eq!(std::fs::read(config.backbone_path()).unwrap(), b"cached");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_offline_resolves_to_no_backbone() {
        let dir = temp_dir();
        let mut config = ModelConfig::new(&dir);

        assert_eq!(resolve_backbone(&config), None);

        config.backbone_url = Some(unreachable_url());
        assert_eq!(resolve_backbone(&config), None);
        assert!(!config.backbone_path().exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
