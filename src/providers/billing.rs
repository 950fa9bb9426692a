// GPU-rental billing adapter: instances, credit, billed charges, instance logs and reboot.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{BillingInstance, CostProvider, CostWindow, ProviderError, check_status};
use crate::models::CreditBalance;

pub const DEFAULT_BILLING_URL: &str = "https://console.vast.ai/api/v0/";

/// Payment services whose charges count towards the daily cost.
pub const CHARGE_SERVICES: &[&str] = &[
    "paypal",
    "paypal_manual",
    "crypto.com",
    "coinbase",
    "stripe_connect",
    "stripe_payments",
    "stripe",
    "wise_manual",
    "instance_prepay",
    "transfer",
];

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    #[serde(default)]
    instances_found: u64,
    #[serde(default)]
    instances: Vec<BillingInstance>,
}

#[derive(Debug, Deserialize)]
struct CreditResponse {
    current: CurrentInvoice,
}

#[derive(Debug, Deserialize)]
struct CurrentInvoice {
    #[serde(default)]
    credit: f64,
}

#[derive(Debug, Deserialize)]
struct LogRequestResponse {
    temp_download_url: Option<String>,
}

/// Charge amounts arrive as decimal strings, occasionally as plain numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Decimal {
    Number(f64),
    Text(String),
}

impl Decimal {
    /// Unparseable values count as 0.
    pub fn value(&self) -> f64 {
        match self {
            Decimal::Number(n) => *n,
            Decimal::Text(s) => s.trim().parse().unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Charge {
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub rate: Option<Decimal>,
}

impl Charge {
    pub fn cost(&self) -> f64 {
        let quantity = self.quantity.as_ref().map_or(0.0, Decimal::value);
        let rate = self.rate.as_ref().map_or(0.0, Decimal::value);
        quantity * rate
    }
}

/// Charge filter for the invoices endpoint over `[start, end]`.
pub fn charge_filter(start: DateTime<Utc>, end: DateTime<Utc>) -> serde_json::Value {
    json!({
        "when": { "gte": start.timestamp(), "lte": end.timestamp() },
        "service": { "in": CHARGE_SERVICES },
        "type": { "in": ["charge"] },
        "amount_cents": {},
    })
}

pub struct BillingClient {
    client: Client,
    base_url: Url,
    token: String,
    cost_window: CostWindow,
}

impl BillingClient {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        cost_window: CostWindow,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(crate::version::user_agent())
            .build()?;
        let base_url = Url::parse(base_url).map_err(|e| ProviderError::Url(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token: token.into(),
            cost_window,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|e| ProviderError::Url(e.to_string()))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &'static str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let resp = self
            .authorized(self.client.get(self.url(path)?).query(query))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        resp.json().await.map_err(|e| ProviderError::Shape {
            endpoint: path,
            detail: e.to_string(),
        })
    }

    async fn list_instances(&self) -> Result<InstancesResponse, ProviderError> {
        self.get_json("instances/", &[]).await
    }
}

#[async_trait]
impl CostProvider for BillingClient {
    async fn instances(&self) -> Result<Vec<BillingInstance>, ProviderError> {
        Ok(self.list_instances().await?.instances)
    }

    async fn instance_count(&self) -> Result<u64, ProviderError> {
        Ok(self.list_instances().await?.instances_found)
    }

    #[instrument(skip(self), fields(provider = "billing", operation = "daily_cost"))]
    async fn daily_cost(&self, now: DateTime<Utc>) -> Result<f64, ProviderError> {
        let (start, end) = self.cost_window.bounds(now);
        let filter = charge_filter(start, end).to_string();
        let charges: Vec<Charge> = self
            .get_json("invoices", &[("select_filters", filter)])
            .await?;
        let total = charges.iter().map(Charge::cost).sum();
        debug!(
            charges = charges.len(),
            total,
            window = ?self.cost_window,
            "summed billed charges"
        );
        Ok(total)
    }

    async fn credit(&self) -> Result<CreditBalance, ProviderError> {
        let resp: CreditResponse = self.get_json("users/current/invoices/", &[]).await?;
        Ok(CreditBalance {
            amount: resp.current.credit,
            as_of: Utc::now(),
        })
    }

    async fn request_instance_logs(&self, instance_id: u64) -> Result<String, ProviderError> {
        let url = self.url(&format!("instances/request_logs/{}", instance_id))?;
        let resp = self
            .authorized(self.client.put(url).json(&json!({})))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let body: LogRequestResponse = resp.json().await.map_err(|e| ProviderError::Shape {
            endpoint: "instances/request_logs",
            detail: e.to_string(),
        })?;
        body.temp_download_url
            .filter(|u| !u.is_empty())
            .ok_or(ProviderError::Empty("instances/request_logs"))
    }

    async fn download_logs(&self, url: &str) -> Result<String, ProviderError> {
        // Pre-signed URL: no auth header.
        let resp = self.client.get(url).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.text().await?)
    }

    async fn reboot_instance(&self, instance_id: u64) -> Result<(), ProviderError> {
        let url = self.url(&format!("instances/reboot/{}/", instance_id))?;
        let resp = self.authorized(self.client.put(url)).send().await?;
        check_status(resp).await?;
        Ok(())
    }
}
