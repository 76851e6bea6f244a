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

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;

use crate::catalog::DefaultPolicy;
use crate::identity::{CommonName, SecretManagerConfig};
use crate::strng::{self, Strng};
use crate::xds::{GeneratorConfig, SessionConfig};

const POD_NAMESPACE: &str = "POD_NAMESPACE";
const TRUST_DOMAIN: &str = "TRUST_DOMAIN";
const CA_ORGANIZATION: &str = "CA_ORGANIZATION";
const ROOT_CERT_VALIDITY: &str = "ROOT_CERT_VALIDITY";
const CERT_VALIDITY: &str = "CERT_VALIDITY";
const CERT_ROTATION_FRACTION: &str = "CERT_ROTATION_FRACTION";
const CERT_REFRESH_RETRY_DELAY: &str = "CERT_REFRESH_RETRY_DELAY";
const DEFAULT_TRAFFIC_POLICY: &str = "DEFAULT_TRAFFIC_POLICY";
const XDS_PORT: &str = "XDS_PORT";
const ADMIN_PORT: &str = "ADMIN_PORT";
const PROXY_ADMIN_PORT: &str = "PROXY_ADMIN_PORT";
const CLUSTER_DOMAIN: &str = "CLUSTER_DOMAIN";
const CLUSTER_CONNECT_TIMEOUT: &str = "CLUSTER_CONNECT_TIMEOUT";
const XDS_PUSH_TIMEOUT: &str = "XDS_PUSH_TIMEOUT";
const XDS_MAX_PUSH_FAILURES: &str = "XDS_MAX_PUSH_FAILURES";
const LOCAL_CATALOG_PATH: &str = "LOCAL_CATALOG_PATH";
const ROOT_CERT_DIR: &str = "ROOT_CERT_DIR";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const SMC_WORKER_THREADS: &str = "SMC_WORKER_THREADS";
const CONTROL_PLANE_CONFIG: &str = "CONTROL_PLANE_CONFIG";

const DEFAULT_NAMESPACE: &str = "smc-system";
const DEFAULT_TRUST_DOMAIN: &str = "azure.mesh";
const DEFAULT_CA_ORGANIZATION: &str = "Azure Mesh";
const DEFAULT_ROOT_CERT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);
const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(20 * 60);
const DEFAULT_XDS_PORT: u16 = 15128;
const DEFAULT_ADMIN_PORT: u16 = 15014;
const DEFAULT_PROXY_ADMIN_PORT: u16 = 15000;
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_WORKER_THREADS: usize = 2;

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Namespace the control plane runs in.
    pub namespace: String,
    /// Suffix of every issued common name.
    pub trust_domain: Strng,
    pub ca_organization: String,
    pub root_cert_validity: Duration,
    /// Lifetime of issued leaf certificates.
    pub cert_validity: Duration,
    pub cert_rotation_fraction: f64,
    pub cert_refresh_retry_delay: Duration,
    pub default_traffic_policy: DefaultPolicy,

    pub xds_addr: SocketAddr,
    // admin API should only be accessible over localhost
    pub admin_addr: SocketAddr,
    pub proxy_admin_port: u16,
    pub cluster_domain: Strng,
    pub cluster_connect_timeout: Duration,
    pub xds_push_timeout: Duration,
    pub xds_max_push_failures: u32,

    /// YAML catalog fed into the mesh catalog at startup.
    #[serde(skip_serializing)]
    pub local_catalog_config: Option<ConfigSource>,
    /// Where `root-cert.pem` is written after bootstrap.
    pub root_cert_dir: Option<PathBuf>,
    pub termination_grace_period: Duration,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,
}

impl Config {
    pub fn secret_manager_config(&self) -> SecretManagerConfig {
        SecretManagerConfig {
            rotation_fraction: self.cert_rotation_fraction,
            refresh_retry_delay: self.cert_refresh_retry_delay,
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            trust_domain: self.trust_domain.clone(),
            cluster_domain: self.cluster_domain.clone(),
            proxy_admin_port: self.proxy_admin_port,
            connect_timeout: self.cluster_connect_timeout,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            push_timeout: self.xds_push_timeout,
            max_push_failures: self.xds_max_push_failures,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        CommonName::from_str(&self.trust_domain)
            .map_err(|e| Error::Invalid(format!("trust domain: {e}")))?;
        if self.ca_organization.is_empty() {
            return Err(Error::Invalid("CA organization must be set".to_string()));
        }
        if self.cert_validity.is_zero() || self.cert_validity >= self.root_cert_validity {
            return Err(Error::Invalid(format!(
                "certificate validity {:?} must be positive and shorter than the root's {:?}",
                self.cert_validity, self.root_cert_validity
            )));
        }
        if !(self.cert_rotation_fraction > 0.0 && self.cert_rotation_fraction < 1.0) {
            return Err(Error::Invalid(format!(
                "rotation fraction {} must be within (0, 1)",
                self.cert_rotation_fraction
            )));
        }
        if self.xds_push_timeout.is_zero() || self.xds_max_push_failures == 0 {
            return Err(Error::Invalid(
                "push timeout and push failure budget must be positive".to_string(),
            ));
        }
        if self.num_worker_threads == 0 {
            return Err(Error::Invalid("at least one worker thread is required".to_string()));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("error parsing control plane config: {0}")]
    ControlPlaneConfig(anyhow::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Human readable duration, such as `20m` or `1y`.
struct EnvDuration(Duration);

impl FromStr for EnvDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(EnvDuration)
            .map_err(|e| e.to_string())
    }
}

fn parse<T: FromStr>(env: &str) -> Result<Option<T>, Error> {
    match std::env::var(env) {
        Ok(val) => val
            .parse()
            .map(|v| Some(v))
            .map_err(|_| Error::EnvVar(env.to_string(), val)),
        Err(_) => Ok(None),
    }
}

fn parse_default<T: FromStr>(env: &str, default: T) -> Result<T, Error> {
    parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration(env: &str, file: Option<Duration>, default: Duration) -> Result<Duration, Error> {
    Ok(parse::<EnvDuration>(env)?
        .map(|d| d.0)
        .or(file)
        .unwrap_or(default))
}

pub fn parse_config() -> Result<Config, Error> {
    let pc = parse_control_plane_config()?;
    let cfg = construct_config(pc)?;
    cfg.validate()?;
    Ok(cfg)
}

fn parse_control_plane_config() -> Result<ControlPlaneConfig, Error> {
    let mesh_config_path = "./etc/smc/config/mesh";
    let pc_env = parse::<String>(CONTROL_PLANE_CONFIG)?;
    construct_control_plane_config(mesh_config_path, pc_env.as_deref())
        .map_err(Error::ControlPlaneConfig)
}

/// Environment variables win over the mesh config file and the inline YAML.
pub fn construct_config(pc: ControlPlaneConfig) -> Result<Config, Error> {
    let file_duration = |v: &Option<String>, what: &str| -> Result<Option<Duration>, Error> {
        v.as_deref()
            .map(|s| {
                duration_str::parse(s)
                    .map_err(|e| Error::ControlPlaneConfig(anyhow!("{what}: {e}")))
            })
            .transpose()
    };

    Ok(Config {
        namespace: parse_default(POD_NAMESPACE, DEFAULT_NAMESPACE.to_string())?,
        trust_domain: strng::new(
            parse(TRUST_DOMAIN)?
                .or(pc.trust_domain)
                .unwrap_or_else(|| DEFAULT_TRUST_DOMAIN.to_string()),
        ),
        ca_organization: parse(CA_ORGANIZATION)?
            .or(pc.ca_organization)
            .unwrap_or_else(|| DEFAULT_CA_ORGANIZATION.to_string()),
        root_cert_validity: parse_duration(
            ROOT_CERT_VALIDITY,
            file_duration(&pc.root_cert_validity, "rootCertValidity")?,
            DEFAULT_ROOT_CERT_VALIDITY,
        )?,
        cert_validity: parse_duration(
            CERT_VALIDITY,
            file_duration(&pc.cert_validity, "certValidity")?,
            DEFAULT_CERT_VALIDITY,
        )?,
        cert_rotation_fraction: parse(CERT_ROTATION_FRACTION)?
            .or(pc.cert_rotation_fraction)
            .unwrap_or(crate::identity::manager::DEFAULT_ROTATION_FRACTION),
        cert_refresh_retry_delay: parse_duration(
            CERT_REFRESH_RETRY_DELAY,
            None,
            crate::identity::manager::CERT_REFRESH_FAILURE_RETRY_DELAY,
        )?,
        default_traffic_policy: parse(DEFAULT_TRAFFIC_POLICY)?
            .or(pc.default_traffic_policy)
            .unwrap_or_default(),

        xds_addr: SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            parse_default(XDS_PORT, pc.xds_port.unwrap_or(DEFAULT_XDS_PORT))?,
        ),
        admin_addr: SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            parse_default(ADMIN_PORT, pc.admin_port.unwrap_or(DEFAULT_ADMIN_PORT))?,
        ),
        proxy_admin_port: parse_default(
            PROXY_ADMIN_PORT,
            pc.proxy_admin_port.unwrap_or(DEFAULT_PROXY_ADMIN_PORT),
        )?,
        cluster_domain: strng::new(
            parse(CLUSTER_DOMAIN)?
                .or(pc.cluster_domain)
                .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string()),
        ),
        cluster_connect_timeout: parse_duration(
            CLUSTER_CONNECT_TIMEOUT,
            None,
            DEFAULT_CONNECT_TIMEOUT,
        )?,
        xds_push_timeout: parse_duration(
            XDS_PUSH_TIMEOUT,
            None,
            SessionConfig::default().push_timeout,
        )?,
        xds_max_push_failures: parse_default(
            XDS_MAX_PUSH_FAILURES,
            SessionConfig::default().max_push_failures,
        )?,

        local_catalog_config: parse::<PathBuf>(LOCAL_CATALOG_PATH)?.map(ConfigSource::File),
        root_cert_dir: parse::<PathBuf>(ROOT_CERT_DIR)?.or(pc.root_cert_dir),
        termination_grace_period: parse_duration(
            TERMINATION_GRACE_PERIOD,
            file_duration(&pc.termination_drain_duration, "terminationDrainDuration")?,
            DEFAULT_DRAIN_DURATION,
        )?,
        num_worker_threads: parse_default(
            SMC_WORKER_THREADS,
            pc.concurrency.unwrap_or(DEFAULT_WORKER_THREADS),
        )?,
    })
}

#[derive(serde::Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshConfig {
    pub control_plane: Option<ControlPlaneConfig>,
}

/// Settings that may come from the mesh config file or the
/// `CONTROL_PLANE_CONFIG` YAML.
#[derive(serde::Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    pub trust_domain: Option<String>,
    pub ca_organization: Option<String>,
    pub root_cert_validity: Option<String>,
    pub cert_validity: Option<String>,
    pub cert_rotation_fraction: Option<f64>,
    pub default_traffic_policy: Option<DefaultPolicy>,
    pub xds_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub proxy_admin_port: Option<u16>,
    pub cluster_domain: Option<String>,
    pub root_cert_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub termination_drain_duration: Option<String>,
}

impl ControlPlaneConfig {
    fn merge(self, other: Self) -> Self {
        ControlPlaneConfig {
            trust_domain: other.trust_domain.or(self.trust_domain),
            ca_organization: other.ca_organization.or(self.ca_organization),
            root_cert_validity: other.root_cert_validity.or(self.root_cert_validity),
            cert_validity: other.cert_validity.or(self.cert_validity),
            cert_rotation_fraction: other.cert_rotation_fraction.or(self.cert_rotation_fraction),
            default_traffic_policy: other.default_traffic_policy.or(self.default_traffic_policy),
            xds_port: other.xds_port.or(self.xds_port),
            admin_port: other.admin_port.or(self.admin_port),
            proxy_admin_port: other.proxy_admin_port.or(self.proxy_admin_port),
            cluster_domain: other.cluster_domain.or(self.cluster_domain),
            root_cert_dir: other.root_cert_dir.or(self.root_cert_dir),
            concurrency: other.concurrency.or(self.concurrency),
            termination_drain_duration: other
                .termination_drain_duration
                .or(self.termination_drain_duration),
        }
    }
}

fn construct_control_plane_config(
    mc_path: &str,
    pc_env: Option<&str>,
) -> anyhow::Result<ControlPlaneConfig> {
    let mesh_config = match fs::File::open(mc_path) {
        Ok(f) => serde_yaml::from_reader(f)
            .map(|v: MeshConfig| v.control_plane)
            .map_err(anyhow::Error::new),
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(None)
            } else {
                Err(anyhow!(e))
            }
        }
    }
    .map_err(|e| anyhow!("failed parsing mesh config file {}: {}", mc_path, e))?;

    let pc_env = pc_env
        .map(|pc_env| {
            if pc_env.is_empty() {
                Ok(None)
            } else {
                serde_yaml::from_str(pc_env)
            }
        })
        .unwrap_or(Ok(None))
        .map_err(|e| anyhow!("failed parsing control plane config env: {}", e))?;

    Ok([mesh_config, pc_env]
        .into_iter()
        .flatten()
        .fold(ControlPlaneConfig::default(), |pc, v| pc.merge(v)))
}
