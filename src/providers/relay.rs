// Relay tRPC adapter: login, fleet/user/worker metrics, worker list.
// Every endpoint is a batch call: `<endpoint>?batch=1&input={"0":{"json":...}}`, answered by
// `[{"result":{"data":{"json": <value>}}}]`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{instrument, warn};

use super::{
    Credentials, FleetMetricsProvider, FleetReport, GeneralReport, InstanceReport, ProviderError,
    Session, UserReport, WorkerReport, check_status,
};

pub const DEFAULT_RELAY_URL: &str = "https://relay.inference.supply/api/trpc/";

const EP_LOGIN: &str = "user.login";
const EP_VERSIONS: &str = "system.bucketVersions";
const EP_RUNNING_INSTANCES: &str = "metrics.runningInstanceCount";
const EP_RPM: &str = "metrics.rpm";
const EP_TOKENS_24H: &str = "metrics.tokensLast24Hours";
const EP_TOKENS_ALL_TIME: &str = "metrics.tokensAllTime";
const EP_GENERATIONS_24H: &str = "metrics.generationsLast24Hours";
const EP_GENERATIONS_HISTORY: &str = "metrics.generationsHistory";
const EP_WORKER_LIST: &str = "worker.list";

/// Hours of generation history requested; only the newest bucket is used.
const HISTORY_HOURS_BACK: u32 = 2;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: EnvelopeResult<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeResult<T> {
    data: EnvelopeData<T>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData<T> {
    json: T,
}

/// The shapes a scalar metric has been observed to arrive in.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Nested { json: Option<f64> },
    Other(Value),
}

impl MetricValue {
    /// Numeric value; anything unparseable is treated as unavailable (0).
    pub fn resolve(&self, endpoint: &str) -> f64 {
        match self {
            MetricValue::Number(n) => *n,
            MetricValue::Nested { json } => json.unwrap_or(0.0),
            MetricValue::Text(s) => s.trim().parse().unwrap_or_else(|_| {
                warn!(endpoint, value = %s, "non-numeric metric value; using 0");
                0.0
            }),
            MetricValue::Other(v) => {
                warn!(endpoint, value = %v, "unexpected metric shape; using 0");
                0.0
            }
        }
    }
}

/// Clamp a float metric into a counter.
fn as_count(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 { v as u64 } else { 0 }
}

#[derive(Debug, Deserialize)]
struct HistoryPoint {
    #[serde(default)]
    value: f64,
}

#[derive(Debug, Deserialize)]
struct VersionsJson {
    #[serde(rename = "cliVersion", default)]
    cli_version: String,
}

#[derive(Debug, Deserialize)]
struct LoginJson {
    #[serde(default)]
    token: String,
    user: Option<LoginUser>,
}

#[derive(Debug, Deserialize)]
struct LoginUser {
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct WorkerListJson {
    #[serde(default)]
    workers: Vec<WorkerJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerJson {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_archived: bool,
    #[serde(default)]
    team_id: String,
    #[serde(default)]
    instances: Vec<InstanceJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceJson {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    pool_assignments: Vec<PoolAssignment>,
    #[serde(default)]
    info: Option<InstanceInfo>,
}

#[derive(Debug, Deserialize)]
struct PoolAssignment {
    lane: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceInfo {
    runtime: Option<String>,
    version: Option<String>,
    ip_address: Option<String>,
    nvidia_smi: Option<NvidiaSmi>,
}

#[derive(Debug, Deserialize)]
struct NvidiaSmi {
    #[serde(default)]
    gpu: Vec<GpuInfo>,
}

#[derive(Debug, Deserialize)]
struct GpuInfo {
    #[serde(default)]
    product_name: Vec<String>,
}

impl From<InstanceJson> for InstanceReport {
    fn from(inst: InstanceJson) -> Self {
        let info = inst.info.unwrap_or_default();
        let gpu_name = info
            .nvidia_smi
            .as_ref()
            .and_then(|smi| smi.gpu.first())
            .and_then(|gpu| gpu.product_name.first())
            .cloned();
        let lane = inst.pool_assignments.first().and_then(|p| p.lane.clone());
        // The runtime is only meaningful once the instance is assigned to a pool.
        let runtime = if inst.pool_assignments.is_empty() {
            None
        } else {
            info.runtime
        };
        InstanceReport {
            id: inst.id,
            name: inst.name,
            status: inst.status,
            runtime,
            lane,
            ip: info.ip_address,
            gpu_name,
            version: info.version.filter(|v| !v.is_empty()),
        }
    }
}

pub struct RelayClient {
    client: Client,
    base_url: Url,
}

impl RelayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(crate::version::user_agent())
            .build()?;
        let base_url = Url::parse(base_url).map_err(|e| ProviderError::Url(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(endpoint)
            .map_err(|e| ProviderError::Url(e.to_string()))
    }

    /// GET a batch query; `payload = None` sends the relay's "undefined" input.
    async fn query<T: DeserializeOwned>(
        &self,
        session: &Session,
        endpoint: &'static str,
        payload: Option<Value>,
    ) -> Result<T, ProviderError> {
        let input = match payload {
            Some(p) => json!({ "0": { "json": p } }),
            None => json!({ "0": { "json": null, "meta": { "values": ["undefined"] } } }),
        };
        let resp = self
            .client
            .get(self.endpoint_url(endpoint)?)
            .query(&[("batch", "1".to_string()), ("input", input.to_string())])
            .bearer_auth(&session.token)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let envelopes: Vec<Envelope<T>> =
            resp.json().await.map_err(|e| ProviderError::Shape {
                endpoint,
                detail: e.to_string(),
            })?;
        envelopes
            .into_iter()
            .next()
            .map(|e| e.result.data.json)
            .ok_or(ProviderError::Empty(endpoint))
    }

    async fn metric(
        &self,
        session: &Session,
        endpoint: &'static str,
        payload: Option<Value>,
    ) -> Result<f64, ProviderError> {
        let value: Option<MetricValue> = self.query(session, endpoint, payload).await?;
        Ok(value.map_or(0.0, |v| v.resolve(endpoint)))
    }

    /// Newest hourly generations bucket for the given filter object.
    async fn last_hour_generations(
        &self,
        session: &Session,
        filter: Value,
    ) -> Result<Option<u64>, ProviderError> {
        // Keys in alphabetical order so the encoded input is stable.
        let mut payload = serde_json::Map::new();
        payload.insert("hoursBack".into(), json!(HISTORY_HOURS_BACK));
        if let Value::Object(fields) = filter {
            payload.extend(fields);
        }
        let history: Option<Vec<HistoryPoint>> = self
            .query(session, EP_GENERATIONS_HISTORY, Some(Value::Object(payload)))
            .await?;
        Ok(history
            .unwrap_or_default()
            .first()
            .map(|p| as_count(p.value)))
    }

    async fn general(&self, session: &Session) -> Result<GeneralReport, ProviderError> {
        let versions: VersionsJson = self.query(session, EP_VERSIONS, None).await?;
        Ok(GeneralReport {
            cli_version: versions.cli_version,
            running_instances: as_count(self.metric(session, EP_RUNNING_INSTANCES, None).await?),
            rpm: as_count(self.metric(session, EP_RPM, None).await?),
            tokens_last_24h: as_count(self.metric(session, EP_TOKENS_24H, Some(json!({}))).await?),
            tokens_all_time: as_count(
                self.metric(session, EP_TOKENS_ALL_TIME, Some(json!({})))
                    .await?,
            ),
            generations_last_24h: as_count(
                self.metric(session, EP_GENERATIONS_24H, Some(json!({})))
                    .await?,
            ),
            generations_last_hour: self
                .last_hour_generations(session, json!({}))
                .await?,
        })
    }

    async fn user(&self, session: &Session) -> Result<UserReport, ProviderError> {
        let filter = json!({ "workerTeamId": session.user_id });
        Ok(UserReport {
            tokens_last_24h: as_count(
                self.metric(session, EP_TOKENS_24H, Some(filter.clone()))
                    .await?,
            ),
            tokens_all_time: as_count(
                self.metric(session, EP_TOKENS_ALL_TIME, Some(filter.clone()))
                    .await?,
            ),
            generations_last_24h: as_count(
                self.metric(session, EP_GENERATIONS_24H, Some(filter.clone()))
                    .await?,
            ),
            generations_last_hour: self.last_hour_generations(session, filter).await?,
        })
    }

    async fn workers(&self, session: &Session) -> Result<Vec<WorkerReport>, ProviderError> {
        let list: WorkerListJson = self.query(session, EP_WORKER_LIST, None).await?;
        let mut out = Vec::with_capacity(list.workers.len());
        for w in list.workers.into_iter().filter(|w| !w.is_archived) {
            let filter = json!({ "workerId": w.id, "workerTeamId": w.team_id });
            out.push(WorkerReport {
                tokens_last_24h: as_count(
                    self.metric(session, EP_TOKENS_24H, Some(filter.clone()))
                        .await?,
                ),
                tokens_all_time: as_count(
                    self.metric(session, EP_TOKENS_ALL_TIME, Some(filter.clone()))
                        .await?,
                ),
                generations_last_24h: as_count(
                    self.metric(session, EP_GENERATIONS_24H, Some(filter.clone()))
                        .await?,
                ),
                generations_last_hour: self.last_hour_generations(session, filter).await?,
                id: w.id,
                name: w.name,
                instances: w.instances.into_iter().map(InstanceReport::from).collect(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl FleetMetricsProvider for RelayClient {
    #[instrument(skip(self, credentials), fields(provider = "relay", operation = "login"))]
    async fn login(&self, credentials: &Credentials) -> Result<Session, ProviderError> {
        let body = json!({
            "0": {
                "json": {
                    "email": credentials.email,
                    "password": credentials.password,
                    "twoFactorToken": null,
                },
                "meta": { "values": { "twoFactorToken": ["undefined"] } },
            }
        });
        let resp = self
            .client
            .post(self.endpoint_url(EP_LOGIN)?)
            .query(&[("batch", "1")])
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let envelopes: Vec<Envelope<LoginJson>> =
            resp.json().await.map_err(|e| ProviderError::Shape {
                endpoint: EP_LOGIN,
                detail: e.to_string(),
            })?;
        let login = envelopes
            .into_iter()
            .next()
            .map(|e| e.result.data.json)
            .ok_or(ProviderError::Empty(EP_LOGIN))?;
        match (login.token.is_empty(), login.user) {
            (false, Some(user)) => Ok(Session {
                token: login.token,
                user_id: user.id,
            }),
            _ => Err(ProviderError::Auth(format!(
                "failed to log in account {}",
                credentials.email
            ))),
        }
    }

    #[instrument(skip(self, session), fields(provider = "relay", operation = "fetch_report"))]
    async fn fetch_report(&self, session: &Session) -> Result<FleetReport, ProviderError> {
        let general = self.general(session).await?;
        let user = self.user(session).await?;
        let workers = self.workers(session).await?;
        Ok(FleetReport {
            general,
            user,
            workers,
        })
    }
}
