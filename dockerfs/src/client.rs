use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri as UnixUri};

use crate::error::{Error, Result};

pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Issues GET/HEAD/PUT requests to a container runtime's control-plane API
/// reached over a local UNIX domain socket.
pub struct ControlClient {
    runtime: tokio::runtime::Runtime,
    client: Client<UnixConnector, Full<Bytes>>,
    socket: PathBuf,
}

impl ControlClient {
    /// `addr` must be of the form `unix:/absolute/path/to.sock`.
    pub fn connect(addr: &str) -> Result<Self> {
        let socket = addr.strip_prefix("unix:").ok_or_else(|| {
            Error::ProtocolError(format!("unsupported control-plane address: {addr}"))
        })?;
        let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Transport(Box::new(e)))?;
        Ok(Self {
            runtime,
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
            socket: PathBuf::from(socket),
        })
    }

    fn uri(&self, path: &str) -> http::Uri {
        UnixUri::new(&self.socket, path).into()
    }

    pub fn get(&self, path: &str) -> Result<Response> {
        self.runtime.block_on(self.request(Method::GET, path, Full::default()))
    }

    pub fn head(&self, path: &str) -> Result<Response> {
        self.runtime.block_on(self.request(Method::HEAD, path, Full::default()))
    }

    pub fn put(&self, path: &str, content_type: &str, body: Vec<u8>) -> Result<Response> {
        self.runtime.block_on(self.request_with_content_type(
            Method::PUT,
            path,
            content_type,
            Full::from(body),
        ))
    }

    /// Streams a GET response body to `dest` chunk-by-chunk, never buffering
    /// the whole response, for the one caller (snapshot export) whose
    /// payload may be as large as the entire container filesystem.
    pub fn get_to_writer(&self, path: &str, dest: &mut dyn Write) -> Result<()> {
        self.runtime.block_on(async {
            let uri = self.uri(path);
            let req = http::Request::builder()
                .method(Method::GET)
                .uri(uri.clone())
                .body(Full::default())
                .map_err(|e| Error::Transport(Box::new(e)))?;
            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| Error::Transport(Box::new(e)))?;
            let status = resp.status();
            if status.as_u16() == 404 {
                return Err(Error::NotFound);
            }
            let mut body = resp.into_body();
            loop {
                match body.frame().await {
                    Some(Ok(frame)) => {
                        if let Some(data) = frame.data_ref() {
                            dest.write_all(data)
                                .map_err(|e| Error::Transport(Box::new(e)))?;
                        }
                    }
                    Some(Err(e)) => return Err(Error::Transport(Box::new(e))),
                    None => break,
                }
            }
            if status.as_u16() != 200 {
                return Err(Error::Unexpected {
                    method: Method::GET,
                    url: path.to_string(),
                    status: status.as_u16(),
                });
            }
            Ok(())
        })
    }

    async fn request(&self, method: Method, path: &str, body: Full<Bytes>) -> Result<Response> {
        self.request_with_content_type(method, path, "", body).await
    }

    async fn request_with_content_type(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Full<Bytes>,
    ) -> Result<Response> {
        let uri = self.uri(path);
        let mut builder = http::Request::builder().method(method.clone()).uri(uri);
        if !content_type.is_empty() {
            builder = builder.header(http::header::CONTENT_TYPE, content_type);
        }
        let req = builder
            .body(body)
            .map_err(|e| Error::Transport(Box::new(e)))?;
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let collected = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(Box::new(e)))?;
        let body = collected.to_bytes();
        match status.as_u16() {
            404 => Err(Error::NotFound),
            200 => Ok(Response {
                status,
                headers,
                body,
            }),
            other => Err(Error::Unexpected {
                method,
                url: path.to_string(),
                status: other,
            }),
        }
    }
}

/// Creates `~/.cache/dockerfs/` (mode 0750) if absent and returns its path.
pub fn default_cache_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "dockerfs")
        .ok_or_else(|| Error::ProtocolError("no home directory available".to_string()))?;
    let dir = dirs.cache_dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    set_mode(&dir, 0o750)?;
    Ok(dir)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

pub fn create_scratch_file(cache_dir: &Path, container_id: &str) -> Result<(PathBuf, File)> {
    let path = cache_dir.join(format!("content_{container_id}.tar"));
    let file = File::create(&path)?;
    Ok((path, file))
}
