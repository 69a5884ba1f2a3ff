//! Remote array store over the hub's storage endpoints.
//!
//! `GET {api}/storage/dataset/{owner}/{name}/ls?path=<root>` lists every
//! object under the root. `GET|PUT|DELETE .../<root>/<key>` address single
//! objects; GET and PUT may answer with a 307 naming a signed location.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::error::HubError;
use crate::session::{check_hub_response, signed_location, HubSession, RequestOptions};
use crate::store::{is_metadata_key, parse_consolidated, ArrayStore, CONSOLIDATED_METADATA_KEY};

/// How a remote array store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`
    Read,
    /// `r+`: read with append
    ReadWrite,
    /// `w`
    Write,
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        !matches!(self, OpenMode::Write)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

impl FromStr for OpenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(OpenMode::Read),
            "r+" => Ok(OpenMode::ReadWrite),
            "w" => Ok(OpenMode::Write),
            other => Err(format!("unknown open mode '{}' (r, r+, w)", other)),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpenMode::Read => "r",
            OpenMode::ReadWrite => "r+",
            OpenMode::Write => "w",
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListedObject {
    Name(String),
    Detailed { name: String },
}

impl ListedObject {
    fn name(&self) -> &str {
        match self {
            ListedObject::Name(name) | ListedObject::Detailed { name } => name,
        }
    }
}

/// Store key for a name returned by the hub's listing of `root`.
///
/// Names are usually rooted (`data.zarr/x/0`) but may already be relative
/// (`x/0`). The root itself and entries of a sibling store are not keys.
fn listing_key<'n>(root: &str, name: &'n str) -> Option<&'n str> {
    let name = name.trim_start_matches('/');
    let key = match name.strip_prefix(root) {
        Some(rest) if rest.is_empty() => return None,
        Some(rest) if rest.starts_with('/') => &rest[1..],
        _ => {
            let first = name.split('/').next().unwrap_or_default();
            if name.contains('/') && first.ends_with(".zarr") {
                return None;
            }
            name
        }
    };
    (!key.is_empty() && !key.ends_with('/')).then_some(key)
}

/// Array store whose objects live on the hub.
pub struct HubArrayStore<'a> {
    session: &'a HubSession,
    base: String,
    root: String,
    mode: OpenMode,
    consolidated: Option<BTreeMap<String, serde_json::Value>>,
    listing: RefCell<Option<BTreeSet<String>>>,
}

impl<'a> HubArrayStore<'a> {
    /// Open `root` inside dataset `owner/name`.
    ///
    /// Consolidated metadata is only valid for `Read` and `ReadWrite`; asking
    /// for it in `Write` mode fails before any request is made.
    pub fn open(
        session: &'a HubSession,
        owner: &str,
        name: &str,
        root: &str,
        mode: OpenMode,
        as_consolidated: bool,
    ) -> Result<Self, HubError> {
        if as_consolidated && !mode.can_read() {
            return Err(HubError::Configuration(format!(
                "consolidated metadata can only be used with 'r' or 'r+' mode, not '{}'",
                mode
            )));
        }
        let root = root.trim_matches('/');
        if root.is_empty() {
            return Err(HubError::Configuration("array store root must not be empty".into()));
        }

        let mut store = Self {
            session,
            base: format!("/storage/dataset/{}/{}", owner, name),
            root: root.to_string(),
            mode,
            consolidated: None,
            listing: RefCell::new(None),
        };

        if as_consolidated {
            let bytes = store.fetch(CONSOLIDATED_METADATA_KEY)?.ok_or_else(|| {
                HubError::Store(format!(
                    "{}/{} has no consolidated metadata under '{}'",
                    owner, name, store.root
                ))
            })?;
            store.consolidated = Some(parse_consolidated(&bytes)?);
        }
        log::debug!("opened {}/{} (mode {})", store.base, store.root, mode);
        Ok(store)
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated.is_some()
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.base, self.root, key)
    }

    fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        let resp = self
            .session
            .request(Method::GET, &self.object_url(key), RequestOptions::new())?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TEMPORARY_REDIRECT => {
                let location = signed_location(resp)?;
                self.session.download_signed(&location).map(Some)
            }
            _ => {
                let resp = check_hub_response(resp)?;
                let bytes = resp
                    .bytes()
                    .map_err(|e| HubError::Network(format!("failed to read '{}': {}", key, e)))?;
                Ok(Some(bytes.to_vec()))
            }
        }
    }

    fn remote_listing(&self) -> Result<BTreeSet<String>, HubError> {
        if let Some(listing) = self.listing.borrow().as_ref() {
            return Ok(listing.clone());
        }

        let body = self.session.hub_json(
            Method::GET,
            &format!("{}/ls", self.base),
            RequestOptions::new().query("path", &self.root),
        )?;
        let objects: Vec<ListedObject> = match body {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::Object(mut map) if map.contains_key("data") => {
                serde_json::from_value(map.remove("data").unwrap_or_default())
                    .map_err(|e| HubError::Parse(format!("invalid store listing: {}", e)))?
            }
            other => serde_json::from_value(other)
                .map_err(|e| HubError::Parse(format!("invalid store listing: {}", e)))?,
        };

        let mut listing = BTreeSet::new();
        for object in &objects {
            match listing_key(&self.root, object.name()) {
                Some(key) => {
                    listing.insert(key.to_string());
                }
                None => log::debug!("ignoring '{}' in listing of {}", object.name(), self.root),
            }
        }
        *self.listing.borrow_mut() = Some(listing.clone());
        Ok(listing)
    }

    fn require_write(&self, key: &str) -> Result<(), HubError> {
        if self.mode.can_write() {
            Ok(())
        } else {
            Err(HubError::Store(format!("cannot write '{}': store opened read-only", key)))
        }
    }
}

impl ArrayStore for HubArrayStore<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, HubError> {
        if let Some(metadata) = &self.consolidated {
            if is_metadata_key(key) {
                return match metadata.get(key) {
                    Some(value) => serde_json::to_vec(value)
                        .map(Some)
                        .map_err(|e| HubError::Store(e.to_string())),
                    None => Ok(None),
                };
            }
        }
        self.fetch(key)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), HubError> {
        self.require_write(key)?;
        self.session
            .put_through_redirect(&self.object_url(key), "application/octet-stream", value.to_vec())?;

        if let Some(listing) = self.listing.borrow_mut().as_mut() {
            listing.insert(key.to_string());
        }
        if let Some(metadata) = self.consolidated.as_mut() {
            if is_metadata_key(key) {
                if let Ok(parsed) = serde_json::from_slice(value) {
                    metadata.insert(key.to_string(), parsed);
                }
            }
        }
        Ok(())
    }

    /// Answered from one listing request, kept current by this store's own writes.
    fn contains(&self, key: &str) -> Result<bool, HubError> {
        if let Some(metadata) = &self.consolidated {
            if is_metadata_key(key) {
                return Ok(metadata.contains_key(key));
            }
        }
        Ok(self.remote_listing()?.contains(key))
    }

    fn list(&self) -> Result<Vec<String>, HubError> {
        if let Some(metadata) = &self.consolidated {
            let mut keys: Vec<String> = metadata.keys().cloned().collect();
            keys.push(CONSOLIDATED_METADATA_KEY.to_string());
            keys.sort();
            return Ok(keys);
        }
        Ok(self.remote_listing()?.into_iter().collect())
    }

    fn delete(&mut self, key: &str) -> Result<(), HubError> {
        self.require_write(key)?;
        let resp = self
            .session
            .request(Method::DELETE, &self.object_url(key), RequestOptions::new())?;
        if resp.status() != StatusCode::NOT_FOUND {
            check_hub_response(resp)?;
        }
        if let Some(listing) = self.listing.borrow_mut().as_mut() {
            listing.remove(key);
        }
        if let Some(metadata) = self.consolidated.as_mut() {
            metadata.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::authed_session;
    use httpmock::prelude::*;

    #[test]
    fn test_consolidated_write_mode_rejected_before_network() {
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.path_includes("/");
            then.status(200);
        });
        let session = authed_session(&server);

        let err = HubArrayStore::open(&session, "acme", "solubility", "data.zarr", OpenMode::Write, true)
            .err()
            .unwrap();
        assert!(matches!(err, HubError::Configuration(_)), "{:?}", err);
        any.assert_calls(0);
    }

    #[test]
    fn test_get_follows_signed_redirect_and_maps_404() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/storage/dataset/acme/solubility/data.zarr/features/0");
            then.status(307).json_body(serde_json::json!({
                "url": server.url("/bucket/features/0"),
                "method": "GET",
                "headers": {}
            }));
        });
        let bucket = server.mock(|when, then| {
            when.method(GET)
                .path("/bucket/features/0")
                .header_missing("Authorization");
            then.status(200).body(vec![1u8, 2, 3]);
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/storage/dataset/acme/solubility/data.zarr/features/9");
            then.status(404);
        });

        let session = authed_session(&server);
        let store =
            HubArrayStore::open(&session, "acme", "solubility", "data.zarr", OpenMode::Read, false).unwrap();

        assert_eq!(store.get("features/0").unwrap(), Some(vec![1u8, 2, 3]));
        bucket.assert();
        assert_eq!(store.get("features/9").unwrap(), None);
    }

    #[test]
    fn test_consolidated_read_serves_metadata_locally() {
        let server = MockServer::start();
        let zmetadata = server.mock(|when, then| {
            when.method(GET)
                .path("/api/storage/dataset/acme/solubility/data.zarr/.zmetadata");
            then.status(200).json_body(serde_json::json!({
                "zarr_consolidated_format": 1,
                "metadata": {
                    ".zgroup": {"zarr_format": 2},
                    "features/.zarray": {"shape": [4], "chunks": [2]}
                }
            }));
        });
        let listing = server.mock(|when, then| {
            when.method(GET).path("/api/storage/dataset/acme/solubility/ls");
            then.status(200).json_body(serde_json::json!([]));
        });

        let session = authed_session(&server);
        let store =
            HubArrayStore::open(&session, "acme", "solubility", "data.zarr", OpenMode::Read, true).unwrap();
        assert!(store.is_consolidated());

        let zarray: serde_json::Value =
            serde_json::from_slice(&store.get("features/.zarray").unwrap().unwrap()).unwrap();
        assert_eq!(zarray["shape"][0], 4);
        assert_eq!(
            store.list().unwrap(),
            vec![".zgroup", ".zmetadata", "features/.zarray"]
        );
        zmetadata.assert_calls(1);
        listing.assert_calls(0);
    }

    #[test]
    fn test_listing_strips_root_and_is_cached() {
        let server = MockServer::start();
        let listing = server.mock(|when, then| {
            when.method(GET)
                .path("/api/storage/dataset/acme/solubility/ls")
                .query_param("path", "data.zarr");
            then.status(200).json_body(serde_json::json!([
                {"name": "data.zarr/.zgroup", "size": 17},
                {"name": "data.zarr/features/0", "size": 16},
                "data.zarr/features/1",
                {"name": "other.zarr/.zgroup"}
            ]));
        });

        let session = authed_session(&server);
        let store =
            HubArrayStore::open(&session, "acme", "solubility", "data.zarr", OpenMode::ReadWrite, false).unwrap();

        assert_eq!(store.list().unwrap(), vec![".zgroup", "features/0", "features/1"]);
        assert!(store.contains("features/1").unwrap());
        assert!(!store.contains("features/2").unwrap());
        listing.assert_calls(1);
    }

    #[test]
    fn test_listing_key() {
        assert_eq!(listing_key("data.zarr", "data.zarr/features/0"), Some("features/0"));
        assert_eq!(listing_key("data.zarr", "/data.zarr/.zgroup"), Some(".zgroup"));
        assert_eq!(listing_key("data.zarr", "features/0"), Some("features/0"));
        assert_eq!(listing_key("data.zarr", ".zattrs"), Some(".zattrs"));
        assert_eq!(listing_key("data.zarr", "data.zarr"), None);
        assert_eq!(listing_key("data.zarr", "data.zarr/"), None);
        assert_eq!(listing_key("data.zarr", "other.zarr/.zgroup"), None);
        assert_eq!(listing_key("data.zarr", "data.zarr.bak/x"), Some("data.zarr.bak/x"));
    }

    #[test]
    fn test_relative_listing_names_are_keys() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path("/api/storage/dataset/acme/solubility/ls")
                .query_param("path", "data.zarr");
            then.status(200).json_body(serde_json::json!({
                "data": [{"name": ".zgroup"}, {"name": "features/0"}, "data.zarr/features/1"]
            }));
        });

        let session = authed_session(&server);
        let store =
            HubArrayStore::open(&session, "acme", "solubility", "data.zarr", OpenMode::Read, false).unwrap();

        assert_eq!(store.list().unwrap(), vec![".zgroup", "features/0", "features/1"]);
        assert!(store.contains("features/0").unwrap());
    }

    #[test]
    fn test_read_mode_refuses_writes() {
        let server = MockServer::start();
        let put = server.mock(|when, then| {
            when.method(PUT);
            then.status(200);
        });
        let session = authed_session(&server);
        let mut store =
            HubArrayStore::open(&session, "acme", "solubility", "data.zarr", OpenMode::Read, false).unwrap();
        assert!(matches!(store.put("features/0", b"x"), Err(HubError::Store(_))));
        put.assert_calls(0);
    }

    #[test]
    fn test_open_mode_parse() {
        assert_eq!("r+".parse::<OpenMode>().unwrap(), OpenMode::ReadWrite);
        assert!("a".parse::<OpenMode>().is_err());
        assert_eq!(OpenMode::Write.to_string(), "w");
    }
}
