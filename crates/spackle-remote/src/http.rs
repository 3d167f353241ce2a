use crate::buildcache::{INDEX_HASH_PATH, INDEX_PATH};
use crate::{MirrorConfig, RemoteBackend, RemoteError, PROTOCOL_VERSION};
use std::io::Read;

/// A build-cache mirror served over HTTP(S).
///
/// The index is read with `GET <url>/build_cache/index.json` and its
/// sidecar with `GET <url>/build_cache/index.json.hash`. Publishing PUTs
/// both, index first, to mirrors that accept writes.
pub struct HttpBackend {
    mirror: MirrorConfig,
    agent: ureq::Agent,
}

fn transport_error(url: &str, err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::StatusCode(code) => RemoteError::Status {
            url: url.to_owned(),
            code,
        },
        other => RemoteError::Http(format!("{url}: {other}")),
    }
}

impl HttpBackend {
    pub fn new(mirror: MirrorConfig) -> Self {
        let agent = ureq::Agent::new_with_defaults();
        Self { mirror, agent }
    }

    fn url(&self, relative: &str) -> String {
        format!("{}/{relative}", self.mirror.url)
    }

    fn with_headers<B>(&self, req: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        let req = req.header("X-Spackle-Protocol", &PROTOCOL_VERSION.to_string());
        match &self.mirror.auth_token {
            Some(token) => req.header("Authorization", &format!("Bearer {token}")),
            None => req,
        }
    }

    /// Body of `relative`, or `None` when the mirror answers 404.
    fn download(&self, relative: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let url = self.url(relative);
        tracing::debug!("GET {url}");
        let response = match self.with_headers(self.agent.get(&url)).call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(e) => return Err(transport_error(&url, e)),
        };
        let mut body = Vec::new();
        response
            .into_body()
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(format!("{url}: {e}")))?;
        Ok(Some(body))
    }

    fn upload(&self, relative: &str, content_type: &str, data: &[u8]) -> Result<(), RemoteError> {
        let url = self.url(relative);
        tracing::debug!("PUT {url} ({} bytes)", data.len());
        self.with_headers(self.agent.put(&url))
            .header("Content-Type", content_type)
            .send(data)
            .map_err(|e| transport_error(&url, e))?;
        Ok(())
    }
}

impl RemoteBackend for HttpBackend {
    fn fetch_index(&self) -> Result<Vec<u8>, RemoteError> {
        self.download(INDEX_PATH)?
            .ok_or_else(|| RemoteError::NotFound(self.url(INDEX_PATH)))
    }

    fn fetch_index_hash(&self) -> Result<Option<String>, RemoteError> {
        Ok(self
            .download(INDEX_HASH_PATH)?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_owned()))
    }

    fn store_index(&self, index: &[u8], hash: &str) -> Result<(), RemoteError> {
        self.upload(INDEX_PATH, "application/json", index)?;
        self.upload(INDEX_HASH_PATH, "text/plain", hash.as_bytes())
    }

    fn describe(&self) -> String {
        self.mirror.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{publish_index, BuildCacheIndex, LocalBackend};
    use spackle_schema::{
        parse_one_or_raise, ConcreteSpec, HashPrefix, IndexError, InstallRecord, SpecIndexable,
    };
    use spackle_store::Records;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// One request as seen by the file server.
    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        authorization: Option<String>,
        protocol: Option<String>,
    }

    /// Static file server for a mirror directory, mounted under `/mirror/`.
    /// GET reads files, PUT writes them, paths outside the mount get 403.
    struct FileServer {
        url: String,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl FileServer {
        fn start(root: &Path) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}/mirror", listener.local_addr().unwrap());
            let seen = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&seen);
            let root = root.to_path_buf();
            std::thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    serve_one(stream, &root, &log);
                }
            });
            Self { url, seen }
        }

        fn mirror(&self) -> MirrorConfig {
            MirrorConfig::new("http", &self.url)
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    fn serve_one(mut stream: TcpStream, root: &Path, log: &Mutex<Vec<Seen>>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let mut words = line.split_whitespace();
        let method = words.next().unwrap_or_default().to_owned();
        let path = words.next().unwrap_or_default().to_owned();

        let mut authorization = None;
        let mut protocol = None;
        let mut length = 0;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).unwrap();
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                let value = value.trim().to_owned();
                match name.to_ascii_lowercase().as_str() {
                    "authorization" => authorization = Some(value),
                    "x-spackle-protocol" => protocol = Some(value),
                    "content-length" => length = value.parse().unwrap(),
                    _ => {}
                }
            }
        }
        let mut body = vec![0; length];
        reader.read_exact(&mut body).unwrap();

        let (status, reply) = match path.strip_prefix("/mirror/") {
            None => ("403 Forbidden", Vec::new()),
            Some(relative) if method == "PUT" => {
                let file = root.join(relative);
                std::fs::create_dir_all(file.parent().unwrap()).unwrap();
                std::fs::write(file, &body).unwrap();
                ("201 Created", Vec::new())
            }
            Some(relative) => match std::fs::read(root.join(relative)) {
                Ok(data) => ("200 OK", data),
                Err(_) => ("404 Not Found", Vec::new()),
            },
        };
        log.lock().unwrap().push(Seen {
            method,
            path,
            authorization,
            protocol,
        });
        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            reply.len()
        )
        .unwrap();
        stream.write_all(&reply).unwrap();
    }

    fn records(specs: &[&str]) -> Records {
        specs
            .iter()
            .map(|text| {
                let spec = ConcreteSpec::freeze(&parse_one_or_raise(text, None).unwrap()).unwrap();
                (spec.dag_hash().clone(), InstallRecord::new(spec))
            })
            .collect()
    }

    fn published(specs: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        publish_index(&LocalBackend::new(dir.path()), &records(specs)).unwrap();
        dir
    }

    fn cache_over(server: &FileServer) -> BuildCacheIndex {
        BuildCacheIndex::new("http", Box::new(HttpBackend::new(server.mirror())))
    }

    #[test]
    fn index_is_fetched_and_verified_over_http() {
        let dir = published(&["zlib@1.3", "openssl@3.1"]);
        let server = FileServer::start(dir.path());

        let fetched = cache_over(&server).fetch().unwrap();
        assert_eq!(fetched.len(), 2);
        assert!(fetched.values().all(|r| r.in_buildcache && !r.installed));

        let paths: Vec<_> = server.seen().into_iter().map(|s| s.path).collect();
        assert_eq!(
            paths,
            vec![
                "/mirror/build_cache/index.json.hash",
                "/mirror/build_cache/index.json"
            ]
        );
    }

    #[test]
    fn requests_carry_protocol_and_token() {
        let dir = published(&["zlib@1.3"]);
        let server = FileServer::start(dir.path());
        let backend = HttpBackend::new(server.mirror().with_token("s3cret"));
        assert!(backend.fetch_index_hash().unwrap().is_some());

        let seen = server.seen();
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].authorization.as_deref(), Some("Bearer s3cret"));
        assert_eq!(
            seen[0].protocol.as_deref(),
            Some(PROTOCOL_VERSION.to_string().as_str())
        );
    }

    #[test]
    fn mismatched_sidecar_is_an_integrity_failure() {
        let dir = published(&["zlib@1.3"]);
        std::fs::write(dir.path().join(INDEX_HASH_PATH), "0".repeat(64)).unwrap();
        let server = FileServer::start(dir.path());

        match cache_over(&server).fetch() {
            Err(RemoteError::IntegrityFailure { key, expected, .. }) => {
                assert!(key.ends_with(INDEX_PATH));
                assert_eq!(expected, "0".repeat(64));
            }
            other => panic!("expected an integrity failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_sidecar_serves_index_unverified() {
        let dir = published(&["zlib@1.3"]);
        std::fs::remove_file(dir.path().join(INDEX_HASH_PATH)).unwrap();
        let server = FileServer::start(dir.path());

        assert_eq!(cache_over(&server).fetch().unwrap().len(), 1);
    }

    #[test]
    fn missing_index_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::start(dir.path());

        let backend = HttpBackend::new(server.mirror());
        assert!(backend.fetch_index_hash().unwrap().is_none());
        assert!(matches!(
            backend.fetch_index(),
            Err(RemoteError::NotFound(url)) if url.ends_with(INDEX_PATH)
        ));

        let cache = cache_over(&server);
        let first = cache
            .lookup(&HashPrefix::parse("ab").unwrap())
            .next()
            .unwrap();
        assert!(matches!(first, Err(IndexError::Source(_))));
    }

    #[test]
    fn refused_request_keeps_its_status() {
        let dir = published(&["zlib@1.3"]);
        let server = FileServer::start(dir.path());
        let outside = MirrorConfig::new("http", &server.url.replace("/mirror", "/private"));

        match HttpBackend::new(outside).fetch_index() {
            Err(RemoteError::Status { code, url }) => {
                assert_eq!(code, 403);
                assert!(url.contains("/private/"));
            }
            other => panic!("expected HTTP 403, got {other:?}"),
        }
    }

    #[test]
    fn publishing_over_http_round_trips_through_the_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::start(dir.path());
        let backend = HttpBackend::new(server.mirror());
        publish_index(&backend, &records(&["zlib@1.3", "bzip2@1.0.8"])).unwrap();

        let methods: Vec<_> = server.seen().into_iter().map(|s| s.method).collect();
        assert_eq!(methods, vec!["PUT", "PUT"]);
        assert!(dir.path().join(INDEX_PATH).is_file());

        let local = BuildCacheIndex::new("local", Box::new(LocalBackend::new(dir.path())));
        assert_eq!(local.fetch().unwrap().len(), 2);
        assert_eq!(cache_over(&server).fetch().unwrap().len(), 2);
    }
}
