use url::Url;

use super::{EmbeddedStore, RemoteStore, RemoteStoreConfig, StoreBackend};
use crate::Error;

/// Constructs a new store backend from an URI.
///
/// The following URIs are supported:
/// - `memory://`
///   An embedded store keeping everything in memory.
/// - `redb:///absolute/path/to/somewhere`
///   An embedded store persisting to the given directory. Can only be opened
///   from one process at the same time. Without a path, it lives in memory
///   only.
/// - `remote+http://host:port/DRIVE`, `remote+https://host:port/DRIVE`
///   Connects to the drive named DRIVE of a remote server. The query
///   parameters are deserialized into [RemoteStoreConfig], e.g.
///   `?timeout=10&reconnect_delay=1000`.
pub async fn from_addr(uri: &str) -> Result<Box<dyn StoreBackend>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::ConfigurationError(format!("unable to parse url: {}", e)))?;

    let store: Box<dyn StoreBackend> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::ConfigurationError("invalid url".to_string()));
            }
            Box::new(EmbeddedStore::new_temporary()?)
        }
        "redb" => {
            // redb doesn't support host, and a path can be provided (otherwise
            // it'll live in memory only).
            if url.has_host() {
                return Err(Error::ConfigurationError("no host allowed".to_string()));
            }

            if url.path() == "/" {
                return Err(Error::ConfigurationError(
                    "cowardly refusing to open / with redb".to_string(),
                ));
            }

            if url.path().is_empty() {
                Box::new(EmbeddedStore::new_temporary()?)
            } else {
                Box::new(EmbeddedStore::new(url.path().into()).await?)
            }
        }
        scheme if scheme.starts_with("remote+") => {
            // We need to convert the URL to string, strip the prefix there, and then
            // parse it back as url, as Url::set_scheme() rejects some of the transitions we want to do.
            let mut base_url = {
                let s = url.to_string();
                let stripped = s.strip_prefix("remote+").unwrap_or(&s);
                Url::parse(stripped)
                    .map_err(|e| Error::ConfigurationError(format!("unable to parse url: {}", e)))?
            };

            if !matches!(base_url.scheme(), "http" | "https") || !base_url.has_host() {
                return Err(Error::ConfigurationError(format!(
                    "remote stores need an http(s) url with a host, got {}",
                    uri
                )));
            }

            // the only path segment names the drive.
            let drive = match base_url
                .path_segments()
                .map(|segments| segments.collect::<Vec<_>>())
                .as_deref()
            {
                Some([drive]) if !drive.is_empty() => drive.to_string(),
                _ => {
                    return Err(Error::ConfigurationError(format!(
                        "remote store url must name exactly one drive, got {}",
                        uri
                    )))
                }
            };

            let config: RemoteStoreConfig = serde_qs::from_str(base_url.query().unwrap_or_default())
                .map_err(|e| Error::ConfigurationError(format!("invalid parameters: {}", e)))?;

            base_url.set_path("/");
            base_url.set_query(None);

            Box::new(RemoteStore::connect(base_url, &drive, config).await?)
        }
        scheme => {
            return Err(Error::ConfigurationError(format!(
                "unknown scheme: {}",
                scheme
            )))
        }
    };

    Ok(store)
}
