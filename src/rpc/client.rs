use super::protocol::{
    pack_args, signature, DeviceRequest, ErrorBody, Granted, Health, LoadModule, Loaded, Uploaded,
    WireTensor, ARGS_HEADER, MEAN_HEADER, OUTPUT_HEADER,
};
use super::RpcError;
use crate::tensor::{DeviceBuffers, HostTensor};
use log::{debug, warn};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The tracker endpoint, before a device has been granted.
#[derive(Debug)]
pub struct TrackerClient {
    client: Client,
    base: String,
}

impl TrackerClient {
    /// Checks that the endpoint answers. Kernel calls have no timeout.
    pub fn connect(host: &str, port: u16) -> Result<Self, RpcError> {
        let base = format!("http://{host}:{port}");
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()?;
        let health: Health = client
            .get(format!("{base}/health"))
            .send()
            .and_then(Response::error_for_status)
            .map_err(|source| RpcError::Connect {
                addr: base.clone(),
                source,
            })?
            .json()?;
        debug!("Tracker at {base} is {} ({})", health.status, health.device);
        Ok(Self { client, base })
    }

    /// Asks for the device registered under `key`.
    pub fn request(self, key: &str) -> Result<RemoteSession, RpcError> {
        let response = self
            .client
            .post(format!("{}/sessions", self.base))
            .json(&DeviceRequest {
                key: key.to_string(),
            })
            .send()?;
        if response.status() == StatusCode::FORBIDDEN {
            let body: ErrorBody = response.json()?;
            return Err(RpcError::Denied {
                key: key.to_string(),
                reason: body.error,
            });
        }
        let granted: Granted = check(response)?.json()?;
        debug!(
            "Tracker {} granted device {} for key '{key}' as session {}",
            self.base, granted.device, granted.session
        );
        Ok(RemoteSession {
            url: format!("{}/sessions/{}", self.base, granted.session),
            client: self.client,
            device: granted.device,
            lost: false,
        })
    }
}

/// A granted device. One keep-alive client serves the whole run.
#[derive(Debug)]
pub struct RemoteSession {
    client: Client,
    url: String,
    device: String,
    lost: bool,
}

impl RemoteSession {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether a transport failure has made the session unusable.
    pub fn is_lost(&self) -> bool {
        self.lost
    }

    fn send(&mut self, request: RequestBuilder) -> Result<Response, RpcError> {
        if self.lost {
            return Err(RpcError::ConnectionLost);
        }
        let response = self.transport(request.send())?;
        check(response)
    }

    fn transport<T>(&mut self, result: reqwest::Result<T>) -> Result<T, RpcError> {
        result.map_err(|e| {
            self.lost = true;
            RpcError::Http(e)
        })
    }

    /// Sends the file at `path` to the device, keeping its file name.
    pub fn upload(&mut self, path: &Path) -> Result<String, RpcError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RpcError::Protocol(format!("{} has no file name", path.display())))?;
        let bytes = std::fs::read(path)?;
        let request = self
            .client
            .post(format!("{}/uploads/{name}", self.url))
            .body(bytes);
        let uploaded: Uploaded = self.send(request)?.json()?;
        debug!("Uploaded {} ({} bytes)", uploaded.name, uploaded.bytes);
        Ok(uploaded.name)
    }

    /// Loads the latest upload of `name`. The device rejects any later call
    /// whose arguments differ from `signature`.
    pub fn load_module(
        &mut self,
        name: &str,
        signature: Vec<WireTensor>,
    ) -> Result<RemoteModule<'_>, RpcError> {
        let request = self
            .client
            .post(format!("{}/modules", self.url))
            .json(&LoadModule {
                name: name.to_string(),
                signature,
            });
        let loaded: Loaded = self.send(request)?.json()?;
        Ok(RemoteModule {
            session: self,
            id: loaded.module,
            name: name.to_string(),
        })
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if self.lost {
            return;
        }
        let request = self.client.delete(&self.url);
        if let Err(e) = self.send(request) {
            warn!("Failed to close remote session: {e}");
        }
    }
}

/// A library loaded on the device; freed when dropped.
#[derive(Debug)]
pub struct RemoteModule<'a> {
    session: &'a mut RemoteSession,
    id: u64,
    name: String,
}

impl RemoteModule<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the kernel once and copies the device output back.
    pub fn invoke(&mut self, buffers: &mut DeviceBuffers) -> Result<(), RpcError> {
        let url = format!("{}/modules/{}/invoke", self.session.url, self.id);
        self.call(url, buffers).map(|_| ())
    }

    /// Runs the kernel `number` times on the device and returns the mean
    /// wall time per run in seconds.
    pub fn time_evaluator(
        &mut self,
        buffers: &mut DeviceBuffers,
        number: usize,
    ) -> Result<f64, RpcError> {
        let url = format!("{}/modules/{}/time?number={number}", self.session.url, self.id);
        let mean = self
            .call(url, buffers)?
            .mean
            .ok_or_else(|| RpcError::Protocol(format!("reply has no {MEAN_HEADER} header")))?;
        mean.parse::<f64>()
            .map_err(|e| RpcError::Protocol(format!("bad {MEAN_HEADER} '{mean}': {e}")))
    }

    fn call(&mut self, url: String, buffers: &mut DeviceBuffers) -> Result<CallReply, RpcError> {
        let args = serde_json::to_string(&signature(buffers))?;
        let request = self
            .session
            .client
            .post(url)
            .header(ARGS_HEADER, args)
            .body(pack_args(buffers));
        let response = self.session.send(request)?;
        let reply = CallReply {
            output: serde_json::from_str(&header(&response, OUTPUT_HEADER)?)?,
            mean: response
                .headers()
                .get(MEAN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        let bytes = self.session.transport(response.bytes())?;
        read_back(buffers, &reply.output, &bytes)?;
        Ok(reply)
    }
}

impl Drop for RemoteModule<'_> {
    fn drop(&mut self) {
        if self.session.lost {
            return;
        }
        let request = self
            .session
            .client
            .delete(format!("{}/modules/{}", self.session.url, self.id));
        if let Err(e) = self.session.send(request) {
            warn!("Failed to free remote module {}: {}", self.name, e);
        }
    }
}

/// Headers of a call reply, kept after its body has been read.
struct CallReply {
    output: WireTensor,
    mean: Option<String>,
}

fn header(response: &Response, name: &str) -> Result<String, RpcError> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| RpcError::Protocol(format!("reply has no {name} header")))
}

/// Passes successful replies through and turns error replies into
/// [`RpcError::Remote`].
fn check(response: Response) -> Result<Response, RpcError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>() {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(RpcError::Remote(format!("{status}: {message}")))
}

fn read_back(
    buffers: &mut DeviceBuffers,
    output: &WireTensor,
    bytes: &[u8],
) -> Result<(), RpcError> {
    let tensor = HostTensor::from_le_bytes(output.dtype, &output.shape, bytes)
        .map_err(|e| RpcError::Protocol(e.to_string()))?;
    buffers
        .output
        .copy_from(&tensor)
        .map_err(|e| RpcError::Protocol(format!("device returned mismatched output: {e}")))
}
