//! Device-side endpoint
//!
//! An axum router over per-session state. A session is opened with the
//! device key; it then uploads libraries, loads them with a fixed argument
//! signature and runs them until it is closed. Kernels run on tokio's
//! blocking pool.

use super::protocol::{
    unpack_args, DeviceRequest, ErrorBody, Granted, Health, LoadModule, Loaded, TimeQuery,
    Uploaded, WireTensor, ARGS_HEADER, MAX_BODY_LEN, MEAN_HEADER, OUTPUT_HEADER,
};
use super::RpcError;
use crate::backend::c::{KernelError, LoadedKernel};
use crate::tensor::DeviceBuffers;
use crate::timer;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const DEVICE_NAME: &str = "cpu(0)";

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("no device registered under key '{0}'")]
    Denied(String),
    #[error("unknown session {0}")]
    UnknownSession(u64),
    #[error("unknown module {0}")]
    UnknownModule(u64),
    #[error("module '{0}' was never uploaded")]
    NotUploaded(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("kernel task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Denied(_) => StatusCode::FORBIDDEN,
            ServerError::UnknownSession(_)
            | ServerError::UnknownModule(_)
            | ServerError::NotUploaded(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!("{status}: {self}");
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

struct Module {
    kernel: Arc<LoadedKernel>,
    signature: Vec<WireTensor>,
}

struct Session {
    dir: TempDir,
    /// Latest stored file per upload name
    uploads: FxHashMap<String, PathBuf>,
    modules: FxHashMap<u64, Module>,
    next_upload: u64,
    next_module: u64,
}

impl Session {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("convsweep-session").tempdir()?,
            uploads: FxHashMap::default(),
            modules: FxHashMap::default(),
            next_upload: 0,
            next_module: 0,
        })
    }

    fn module(&self, id: u64) -> Result<(Arc<LoadedKernel>, Vec<WireTensor>), ServerError> {
        let module = self.modules.get(&id).ok_or(ServerError::UnknownModule(id))?;
        Ok((module.kernel.clone(), module.signature.clone()))
    }
}

#[derive(Default)]
struct Registry {
    sessions: FxHashMap<u64, Session>,
    next_session: u64,
}

#[derive(Clone)]
struct DeviceState {
    key: Arc<str>,
    registry: Arc<Mutex<Registry>>,
}

impl DeviceState {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        // handlers never leave the maps half-updated
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_session<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut Session) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let mut registry = self.registry();
        let session = registry
            .sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownSession(id))?;
        f(session)
    }
}

pub struct DeviceServer {
    listener: TcpListener,
    state: DeviceState,
}

impl DeviceServer {
    pub async fn bind(addr: &str, key: impl Into<String>) -> Result<Self, RpcError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: DeviceState {
                key: Arc::from(key.into()),
                registry: Arc::default(),
            },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> Result<(), RpcError> {
        let app = create_router(self.state);
        axum::serve(self.listener, app).await?;
        Ok(())
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), RpcError> {
        let app = create_router(self.state);
        axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Binds and serves on a background thread with its own runtime.
    pub fn spawn(addr: &str, key: impl Into<String>) -> Result<BackgroundServer, RpcError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let server = runtime.block_on(Self::bind(addr, key))?;
        let addr = server.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            runtime.block_on(server.serve_until(async {
                let _ = stopped.await;
            }))
        });
        Ok(BackgroundServer {
            addr,
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// A [`DeviceServer`] running on its own thread; stopped on drop.
pub struct BackgroundServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<(), RpcError>>>,
}

impl BackgroundServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) -> Result<(), RpcError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), RpcError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(RpcError::Remote("device server thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            warn!("Device server stopped with error: {e}");
        }
    }
}

fn create_router(state: DeviceState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", post(open_session_handler))
        .route("/sessions/:session", delete(close_session_handler))
        .route("/sessions/:session/uploads/:name", post(upload_handler))
        .route("/sessions/:session/modules", post(load_module_handler))
        .route(
            "/sessions/:session/modules/:module",
            delete(free_module_handler),
        )
        .route(
            "/sessions/:session/modules/:module/invoke",
            post(invoke_handler),
        )
        .route(
            "/sessions/:session/modules/:module/time",
            post(time_evaluator_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_LEN))
        .with_state(state)
}

async fn health_handler() -> Json<Health> {
    Json(Health {
        status: "healthy".to_string(),
        device: DEVICE_NAME.to_string(),
    })
}

async fn open_session_handler(
    State(state): State<DeviceState>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<Granted>, ServerError> {
    if request.key != *state.key {
        return Err(ServerError::Denied(request.key));
    }
    let session = Session::new()?;
    let mut registry = state.registry();
    let id = registry.next_session;
    registry.next_session += 1;
    registry.sessions.insert(id, session);
    info!("Opened session {id} for key '{}'", request.key);
    Ok(Json(Granted {
        session: id,
        device: DEVICE_NAME.to_string(),
    }))
}

async fn close_session_handler(
    State(state): State<DeviceState>,
    Path(session): Path<u64>,
) -> Result<StatusCode, ServerError> {
    state
        .registry()
        .sessions
        .remove(&session)
        .ok_or(ServerError::UnknownSession(session))?;
    info!("Closed session {session}");
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_handler(
    State(state): State<DeviceState>,
    Path((session, name)): Path<(u64, String)>,
    body: Bytes,
) -> Result<Json<Uploaded>, ServerError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(ServerError::BadRequest(format!("invalid upload name '{name}'")));
    }
    state.with_session(session, |s| {
        // never rewrite a file the loader may still have mapped
        let path = s.dir.path().join(format!("{}_{}", s.next_upload, name));
        s.next_upload += 1;
        std::fs::write(&path, &body)?;
        debug!("Stored upload {name} at {}", path.display());
        s.uploads.insert(name.clone(), path);
        Ok(Json(Uploaded {
            name,
            bytes: body.len() as u64,
        }))
    })
}

async fn load_module_handler(
    State(state): State<DeviceState>,
    Path(session): Path<u64>,
    Json(request): Json<LoadModule>,
) -> Result<Json<Loaded>, ServerError> {
    if request.signature.len() != 3 {
        return Err(ServerError::BadRequest(format!(
            "expected 3 kernel arguments, got {}",
            request.signature.len()
        )));
    }
    state.with_session(session, |s| {
        let path = s
            .uploads
            .get(&request.name)
            .ok_or_else(|| ServerError::NotUploaded(request.name.clone()))?;
        let entry = request.name.trim_end_matches(".so");
        let kernel = LoadedKernel::open(path, entry)?;
        let id = s.next_module;
        s.next_module += 1;
        s.modules.insert(
            id,
            Module {
                kernel: Arc::new(kernel),
                signature: request.signature,
            },
        );
        Ok(Json(Loaded { module: id }))
    })
}

async fn free_module_handler(
    State(state): State<DeviceState>,
    Path((session, module)): Path<(u64, u64)>,
) -> Result<StatusCode, ServerError> {
    state.with_session(session, |s| {
        s.modules
            .remove(&module)
            .ok_or(ServerError::UnknownModule(module))?;
        Ok(StatusCode::NO_CONTENT)
    })
}

async fn invoke_handler(
    State(state): State<DeviceState>,
    Path((session, module)): Path<(u64, u64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let (kernel, mut buffers) = checked_call(&state, session, module, &headers, &body)?;
    let buffers = tokio::task::spawn_blocking(move || -> Result<DeviceBuffers, KernelError> {
        unsafe { kernel.invoke(&mut buffers) }?;
        Ok(buffers)
    })
    .await??;
    output_response(&buffers, None)
}

async fn time_evaluator_handler(
    State(state): State<DeviceState>,
    Path((session, module)): Path<(u64, u64)>,
    Query(query): Query<TimeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let (kernel, mut buffers) = checked_call(&state, session, module, &headers, &body)?;
    let (mean, buffers) =
        tokio::task::spawn_blocking(move || -> Result<(Option<f64>, DeviceBuffers), KernelError> {
            let mean = timer::time_repeated(query.number, || unsafe { kernel.invoke(&mut buffers) })?;
            Ok((mean, buffers))
        })
        .await??;
    let mean = mean.ok_or_else(|| {
        ServerError::BadRequest("time evaluator needs at least one run".to_string())
    })?;
    output_response(&buffers, Some(mean))
}

/// Looks up the module and unpacks the body, rejecting arguments that do not
/// match the signature the module was loaded with.
fn checked_call(
    state: &DeviceState,
    session: u64,
    module: u64,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Arc<LoadedKernel>, DeviceBuffers), ServerError> {
    let (kernel, signature) = state.with_session(session, |s| s.module(module))?;
    let declared: Vec<WireTensor> = headers
        .get(ARGS_HEADER)
        .ok_or_else(|| ServerError::BadRequest(format!("missing {ARGS_HEADER} header")))
        .and_then(|value| {
            serde_json::from_slice(value.as_bytes())
                .map_err(|e| ServerError::BadRequest(format!("bad {ARGS_HEADER} header: {e}")))
        })?;
    if declared != signature {
        return Err(ServerError::BadRequest(format!(
            "arguments {declared:?} do not match module signature {signature:?}"
        )));
    }
    let buffers = unpack_args(&signature, body).map_err(ServerError::BadRequest)?;
    Ok((kernel, buffers))
}

fn output_response(buffers: &DeviceBuffers, mean: Option<f64>) -> Result<Response, ServerError> {
    let output = serde_json::to_string(&WireTensor::of(&buffers.output))
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    let mut response = buffers.output.to_le_bytes().into_response();
    let headers = response.headers_mut();
    headers.insert(OUTPUT_HEADER, header_value(&output)?);
    if let Some(mean) = mean {
        headers.insert(MEAN_HEADER, header_value(&mean.to_string())?);
    }
    Ok(response)
}

fn header_value(value: &str) -> Result<HeaderValue, ServerError> {
    HeaderValue::from_str(value).map_err(|e| ServerError::BadRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::TrackerClient;

    #[test]
    fn test_wrong_key_is_denied() {
        let server = DeviceServer::spawn("127.0.0.1:0", "pixel").unwrap();
        let client = TrackerClient::connect("127.0.0.1", server.addr().port()).unwrap();
        let err = client.request("android").unwrap_err();
        match err {
            RpcError::Denied { key, reason } => {
                assert_eq!(key, "android");
                assert!(reason.contains("android"));
            }
            other => panic!("expected denial, got {other:?}"),
        }
        server.shutdown().unwrap();
    }

    #[test]
    fn test_unknown_upload_cannot_be_loaded() {
        let server = DeviceServer::spawn("127.0.0.1:0", "pixel").unwrap();
        let mut session = TrackerClient::connect("127.0.0.1", server.addr().port())
            .unwrap()
            .request("pixel")
            .unwrap();
        let err = session.load_module("conv_0.so", Vec::new()).unwrap_err();
        assert!(matches!(err, RpcError::Remote(_)));
        let err = session.load_module("conv_0.so", vec![WireTensor::new(crate::DType::F32, &[1]); 3]);
        assert!(err.unwrap_err().to_string().contains("never uploaded"));
        assert!(!session.is_lost());
    }
}
