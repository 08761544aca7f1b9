use super::{Condition, DeviceStore, LedgerEntry, LedgerState, ScanFilter, ScanPage, StoreError};
use crate::types::{DeviceRecord, DeviceUpdate};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use url::Url;

#[derive(Serialize)]
struct ScanRequest<'a> {
    filter: &'a ScanFilter,
    start_key: Option<&'a str>,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    update: &'a DeviceUpdate,
    condition: &'a Condition,
}

#[derive(Serialize)]
struct PutLedgerRequest<'a> {
    state: &'a LedgerState,
    expected_version: Option<u64>,
}

/// Client for the document store's HTTP facade.
///
/// Errors are surfaced as-is; retrying is left to the caller.
pub struct HttpDeviceStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpDeviceStore {
    pub fn new(base_url: Url) -> Self {
        HttpDeviceStore {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Maps the facade's status codes onto store errors.
async fn check_status(response: Response, key: &str) -> Result<Response, StoreError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.to_string())),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            Err(StoreError::ConditionFailed(key.to_string()))
        }
        status if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Unavailable(format!("{status}: {body}")))
        }
        status => Err(StoreError::InvalidResponse(format!("{status} for {key}"))),
    }
}

#[async_trait]
impl DeviceStore for HttpDeviceStore {
    async fn get(&self, device_uid: &str) -> Result<Option<DeviceRecord>, StoreError> {
        let url = self.endpoint(&["devices", device_uid])?;
        let response = self.client.get(url).send().await?;

        match check_status(response, device_uid).await {
            Ok(response) => Ok(Some(response.json::<DeviceRecord>().await?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
        start_key: Option<&str>,
    ) -> Result<ScanPage, StoreError> {
        let url = self.endpoint(&["devices", "scan"])?;
        let response = self
            .client
            .post(url)
            .json(&ScanRequest { filter, start_key })
            .send()
            .await?;

        let page = check_status(response, "devices")
            .await?
            .json::<ScanPage>()
            .await?;
        Ok(page)
    }

    async fn update(
        &self,
        device_uid: &str,
        update: &DeviceUpdate,
        condition: &Condition,
    ) -> Result<DeviceRecord, StoreError> {
        let url = self.endpoint(&["devices", device_uid])?;
        let response = self
            .client
            .patch(url)
            .json(&UpdateRequest { update, condition })
            .send()
            .await?;

        let record = check_status(response, device_uid)
            .await?
            .json::<DeviceRecord>()
            .await?;
        Ok(record)
    }

    async fn get_ledger(&self, user_email: &str) -> Result<Option<LedgerEntry>, StoreError> {
        let url = self.endpoint(&["ledger", user_email])?;
        let response = self.client.get(url).send().await?;

        match check_status(response, user_email).await {
            Ok(response) => Ok(Some(response.json::<LedgerEntry>().await?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put_ledger(
        &self,
        user_email: &str,
        state: &LedgerState,
        expected_version: Option<u64>,
    ) -> Result<LedgerEntry, StoreError> {
        let url = self.endpoint(&["ledger", user_email])?;
        let response = self
            .client
            .put(url)
            .json(&PutLedgerRequest {
                state,
                expected_version,
            })
            .send()
            .await?;

        let entry = check_status(response, user_email)
            .await?
            .json::<LedgerEntry>()
            .await?;
        Ok(entry)
    }
}
