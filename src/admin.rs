// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::catalog::{MeshCatalog, Snapshot};
use crate::config::Config;
use crate::drain::DrainWatcher;
use crate::hyper_util::{self, empty_response, json_response, plaintext_response};
use crate::identity::{CertDump, SecretManager};
use crate::readiness::Ready;
use crate::version::BuildInfo;
use crate::xds::{DiscoveryServer, SessionDump};
use crate::{signal, telemetry};

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text;charset=utf-8;version=1.0.0";

/// Everything the admin endpoints read.
pub struct State {
    pub config: Config,
    pub catalog: Arc<MeshCatalog>,
    pub certs: SecretManager,
    pub xds: Arc<DiscoveryServer>,
    pub ready: Ready,
    pub registry: Arc<Registry>,
    pub shutdown_trigger: signal::ShutdownTrigger,
}

pub struct Service {
    s: hyper_util::Server<State>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDump<'a> {
    version: BuildInfo,
    config: &'a Config,
    catalog: Arc<Snapshot>,
    certificates: Vec<CertDump>,
    sessions: Vec<SessionDump>,
}

impl Service {
    pub async fn new(state: State, drain: DrainWatcher) -> anyhow::Result<Self> {
        let trigger = state.shutdown_trigger.clone();
        let addr = state.config.admin_addr;
        hyper_util::Server::bind("admin", addr, trigger, drain, state)
            .await
            .map(|s| Service { s })
            .map_err(|e| anyhow::anyhow!("failed to bind admin server to {addr}: {e}"))
    }

    pub fn address(&self) -> SocketAddr {
        self.s.address()
    }

    pub fn spawn(self) {
        self.s
            .spawn(|state, req| async move { Ok::<_, Infallible>(handle(&state, req).await) });
    }
}

pub async fn handle<B>(state: &State, req: Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz/ready" => handle_ready(state, &req),
        "/config_dump" => handle_config_dump(state),
        "/metrics" => handle_metrics(&state.registry),
        "/root-cert.pem" => handle_root_cert(state),
        "/logging" => handle_logging(&req),
        "/quitquitquit" => handle_server_shutdown(&state.shutdown_trigger, req.method().clone()).await,
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

fn handle_ready<B>(state: &State, req: &Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::GET | Method::HEAD => {
            let pending = state.ready.pending();
            if pending.is_empty() {
                plaintext_response(StatusCode::OK, "ready\n".into())
            } else {
                plaintext_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!(
                        "not ready, pending: {}\n",
                        pending.into_iter().collect::<Vec<_>>().join(", ")
                    ),
                )
            }
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn handle_config_dump(state: &State) -> Response<Full<Bytes>> {
    json_response(&ConfigDump {
        version: BuildInfo::new(),
        config: &state.config,
        catalog: state.catalog.snapshot(),
        certificates: state.certs.dump(),
        sessions: state.xds.sessions(),
    })
}

fn handle_metrics(registry: &Registry) -> Response<Full<Bytes>> {
    let mut buf = String::new();
    if let Err(err) = encode(&mut buf, registry) {
        return plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    let mut resp = Response::new(Full::new(Bytes::from(buf)));
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(OPENMETRICS_CONTENT_TYPE),
    );
    resp
}

fn handle_root_cert(state: &State) -> Response<Full<Bytes>> {
    match state.certs.root_certificate() {
        Ok(pem) => {
            let mut resp = Response::new(Full::new(pem));
            resp.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/x-pem-file"),
            );
            resp
        }
        Err(e) => plaintext_response(StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n")),
    }
}

async fn handle_server_shutdown(
    shutdown_trigger: &signal::ShutdownTrigger,
    method: Method,
) -> Response<Full<Bytes>> {
    match method {
        Method::POST => {
            shutdown_trigger.shutdown_now().await;
            plaintext_response(StatusCode::OK, "shutdown now\n".into())
        }
        _ => empty_response(StatusCode::METHOD_NOT_ALLOWED),
    }
}

static HELP_STRING: &str = "
usage: POST /logging\t\t\t\t\t\t(To list current level)
usage: POST /logging?level=<level>\t\t\t\t(To change global levels)
usage: POST /logging?level={mod1}:{level1},{mod2}:{level2}\t(To change specific mods' logging level)
usage: POST /logging?reset\t\t\t\t\t(To reset to the startup level)

hint: loglevel:\terror|warn|info|debug|trace|off
hint: mod_name:\tthe module name, i.e. smc::xds
";

fn query_params(query: Option<&str>) -> HashMap<&str, &str> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| kv.split_once('=').unwrap_or((kv, "")))
        .collect()
}

fn handle_logging<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::POST => {
            let qp = query_params(req.uri().query());
            let level = qp.get("level").copied();
            let reset = qp.contains_key("reset");
            if level.is_some() || reset {
                change_log_level(reset, level.unwrap_or_default())
            } else {
                list_loggers()
            }
        }
        Method::GET => list_loggers(),
        _ => plaintext_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Invalid HTTP method\n {HELP_STRING}"),
        ),
    }
}

fn list_loggers() -> Response<Full<Bytes>> {
    match telemetry::get_current_loglevel() {
        Ok(loglevel) => plaintext_response(
            StatusCode::OK,
            format!("current log level is {loglevel}\n"),
        ),
        Err(err) => plaintext_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to get the log level: {err}\n {HELP_STRING}"),
        ),
    }
}

fn change_log_level(reset: bool, level: &str) -> Response<Full<Bytes>> {
    match telemetry::set_level(reset, level) {
        Ok(_) => list_loggers(),
        Err(e) => plaintext_response(
            StatusCode::BAD_REQUEST,
            format!("failed to set new level: {e}\n{HELP_STRING}"),
        ),
    }
}
