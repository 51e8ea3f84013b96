use common::{
    config::ConnectionConfig,
    store::{RangePage, RangeRequest, StoreClient, StoreConnector, StoreError},
};
use reqwest::{blocking::Client, StatusCode};
use serde::Deserialize;
use std::{thread, time::Duration};
use tracing::{debug, warn};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Cuerpo de error que devuelve el gateway del store.
#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Cliente bloqueante contra el endpoint HTTP del store.
/// Sólo se usa desde hilos del pool bloqueante, nunca desde el executor.
pub struct HttpStoreClient {
    http: Client,
    url: String,
    config: ConnectionConfig,
    retry_backoff: Duration,
}

impl HttpStoreClient {
    pub fn new(config: ConnectionConfig) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let url = format!("{}/v1/GetRange", config.endpoint.trim_end_matches('/'));
        Ok(Self {
            http,
            url,
            config,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn send_once(&self, request: &RangeRequest) -> Result<RangePage, StoreError> {
        let resp = self
            .http
            .post(&self.url)
            .header("x-ots-instancename", &self.config.instance_name)
            .header("x-ots-accesskeyid", &self.config.access_key_id)
            .bearer_auth(&self.config.access_key_secret)
            .json(request)
            .send()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<RangePage>()
                .map_err(|e| StoreError::InvalidResponse(e.to_string()));
        }

        let body = resp.text().unwrap_or_default();
        Err(service_error(status, &body))
    }
}

fn service_error(status: StatusCode, body: &str) -> StoreError {
    match serde_json::from_str::<ServiceErrorBody>(body) {
        Ok(err) => StoreError::Service {
            status: status.as_u16(),
            code: err.code,
            message: err.message,
        },
        Err(_) => StoreError::Service {
            status: status.as_u16(),
            code: String::new(),
            message: body.to_string(),
        },
    }
}

/// Errores de conexión, timeouts y 5xx se reintentan; 4xx no.
fn is_retryable(err: &StoreError) -> bool {
    match err {
        StoreError::Connection(_) => true,
        StoreError::Service { status, .. } => *status >= 500,
        StoreError::InvalidResponse(_) => false,
    }
}

impl StoreClient for HttpStoreClient {
    fn get_range(&mut self, request: &RangeRequest) -> Result<RangePage, StoreError> {
        let mut attempt = 0u32;
        loop {
            match self.send_once(request) {
                Ok(page) => return Ok(page),
                Err(e) if is_retryable(&e) && attempt < self.config.max_retries => {
                    let wait = self.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        "get_range falló ({}), reintento {}/{} en {:?}",
                        e, attempt, self.config.max_retries, wait
                    );
                    thread::sleep(wait);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Crea un `HttpStoreClient` por slot del pool.
#[derive(Debug, Clone)]
pub struct HttpStoreConnector {
    config: ConnectionConfig,
}

impl HttpStoreConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

impl StoreConnector for HttpStoreConnector {
    fn connect(&self) -> Result<Box<dyn StoreClient>, StoreError> {
        debug!("creando cliente HTTP para {}", self.config.endpoint);
        Ok(Box::new(HttpStoreClient::new(self.config.clone())?))
    }
}
