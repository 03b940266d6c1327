//! HTTP reachability checks against provisioned endpoints.
//!
//! [`validate_endpoint`] discovers the host from a provisioner output, polls
//! it until the expected status code appears, and only then compares the
//! body and headers. Status polling and content comparison are separate so a
//! converged endpoint serving the wrong content fails fast with the full body
//! instead of burning the retry budget.

use crate::error::{HarnessError, Result};
use crate::provisioner::{ProvisionOptions, Provisioner};
use crate::retry::{RetryBudget, RetryPoller, Sleeper};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::info;

/// One observed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// Header values by lower-cased name, in the order received
    pub headers: BTreeMap<String, Vec<String>>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Builder: append a header value
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// All values received for `name` (case-insensitive)
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Issues a single GET request.
pub trait HttpProbe {
    fn get(&self, url: &str) -> Result<HttpResponse>;
}

impl<P: HttpProbe + ?Sized> HttpProbe for &P {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        (**self).get(url)
    }
}

/// [`HttpProbe`] over a blocking reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    client: HttpClient,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HarnessError::probe(format!("construct HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HttpProbe for ReqwestProbe {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| HarnessError::probe(format!("GET {}: {}", url, e)))?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let body = response
            .text()
            .map_err(|e| HarnessError::probe(format!("read body of {}: {}", url, e)))?;

        Ok(HttpResponse {
            status,
            body,
            headers,
        })
    }
}

/// Where the endpoint's host name comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "output", rename_all = "snake_case")]
pub enum HostOutput {
    /// A scalar output holding the host name
    Scalar(String),
    /// The first element of a list output
    ListFirst(String),
}

impl HostOutput {
    pub fn output_name(&self) -> &str {
        match self {
            HostOutput::Scalar(name) | HostOutput::ListFirst(name) => name,
        }
    }
}

/// Which of the harness's retry budgets a check uses.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// First check against freshly created infrastructure
    Initial,
    #[default]
    Steady,
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_status() -> u16 {
    200
}

/// Expected outcome of one endpoint check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeExpectation {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: HostOutput,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub expected_body: String,
    /// Header name to a value that must be among the observed values
    #[serde(default)]
    pub expected_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub budget: BudgetKind,
}

impl ProbeExpectation {
    pub fn new(protocol: &str, host: HostOutput, path: &str, status: u16, body: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            host,
            path: path.to_string(),
            expected_status: status,
            expected_body: body.to_string(),
            expected_headers: BTreeMap::new(),
            budget: BudgetKind::default(),
        }
    }

    /// Builder: require a header value
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.expected_headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Builder: select the retry budget
    pub fn with_budget(mut self, budget: BudgetKind) -> Self {
        self.budget = budget;
        self
    }

    /// `<protocol>://<host>/<path>`
    pub fn url(&self, host: &str) -> String {
        format!("{}://{}/{}", self.protocol, host, self.path)
    }
}

/// Resolve the host name an expectation targets.
pub fn discover_host<P: Provisioner + ?Sized>(
    provisioner: &P,
    options: &ProvisionOptions,
    host: &HostOutput,
) -> Result<String> {
    let value = match host {
        HostOutput::Scalar(key) => provisioner.output_required(options, key)?,
        HostOutput::ListFirst(key) => provisioner
            .output_list(options, key)?
            .into_iter()
            .next()
            .unwrap_or_default(),
    };
    if value.is_empty() {
        return Err(HarnessError::provisioner(format!(
            "Output {} was empty",
            host.output_name()
        )));
    }
    Ok(value)
}

/// Check one endpoint, sleeping on the calling thread between attempts.
pub fn validate_endpoint<P, H>(
    provisioner: &P,
    options: &ProvisionOptions,
    probe: &H,
    expectation: &ProbeExpectation,
    budget: RetryBudget,
) -> Result<HttpResponse>
where
    P: Provisioner + ?Sized,
    H: HttpProbe + ?Sized,
{
    validate_endpoint_with(
        provisioner,
        options,
        probe,
        expectation,
        &RetryPoller::new(budget)?,
    )
}

/// Check one endpoint with an explicit poller.
///
/// # Errors
///
/// - `Provisioner` if the host output is missing or empty
/// - `RetryExhausted` carrying the last status mismatch or transport error
/// - `BodyMismatch` / `HeaderMismatch` once the status matched
pub fn validate_endpoint_with<P, H, S>(
    provisioner: &P,
    options: &ProvisionOptions,
    probe: &H,
    expectation: &ProbeExpectation,
    poller: &RetryPoller<S>,
) -> Result<HttpResponse>
where
    P: Provisioner + ?Sized,
    H: HttpProbe + ?Sized,
    S: Sleeper,
{
    let host = discover_host(provisioner, options, &expectation.host)?;
    let url = expectation.url(&host);
    let description = format!("Making HTTP request to {}", url);
    info!("{}", description);

    let response = poller.run(&description, || {
        let response = probe.get(&url)?;
        if response.status == expectation.expected_status {
            info!(
                "Got expected status code {} from URL {}",
                expectation.expected_status, url
            );
            Ok(response)
        } else {
            Err(HarnessError::probe(format!(
                "Expected status code {} but got {} from URL {}",
                expectation.expected_status, response.status, url
            )))
        }
    })?;

    if !response.body.contains(&expectation.expected_body) {
        return Err(HarnessError::BodyMismatch {
            url,
            expected: expectation.expected_body.clone(),
            body: response.body,
        });
    }
    info!("URL {} contained expected text {}!", url, expectation.expected_body);

    for (header, expected) in &expectation.expected_headers {
        let observed = response.header_values(header);
        if !observed.iter().any(|v| v == expected) {
            return Err(HarnessError::HeaderMismatch {
                url: url.clone(),
                header: header.clone(),
                expected: expected.clone(),
                observed: observed.to_vec(),
            });
        }
    }

    Ok(response)
}
