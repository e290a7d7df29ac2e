//! HTTP adapters for the order engine's collaborators. Each wraps one
//! endpoint of an external service; timeouts are enforced by the engine,
//! not here.

use {
    anyhow::{Context, Result},
    bigdecimal::BigDecimal,
    model::{ItemId, UserId, order::Order},
    orders::{Delivering, Execution, OnchainExecuting, PaymentVerifying},
    url::Url,
};

pub struct HttpPayments {
    client: reqwest::Client,
    url: Url,
}

impl HttpPayments {
    pub fn new(client: reqwest::Client, base: &Url) -> Result<Self> {
        Ok(Self {
            client,
            url: base.join("verify").context("invalid payment verifier url")?,
        })
    }
}

#[derive(serde::Serialize)]
struct VerifyRequest<'a> {
    proof: &'a str,
    // decimal string; floats would lose precision on the wire
    amount: String,
    payer: &'a str,
}

#[derive(serde::Deserialize)]
struct VerifyResponse {
    valid: bool,
}

#[async_trait::async_trait]
impl PaymentVerifying for HttpPayments {
    async fn verify(&self, proof: &str, amount: &BigDecimal, payer: &UserId) -> Result<bool> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&VerifyRequest {
                proof,
                amount: amount.to_string(),
                payer: payer.as_str(),
            })
            .send()
            .await
            .context("payment verifier unreachable")?
            .error_for_status()
            .context("payment verifier rejected the request")?
            .json::<VerifyResponse>()
            .await
            .context("malformed payment verifier response")?;
        Ok(response.valid)
    }
}

pub struct HttpExecutor {
    client: reqwest::Client,
    url: Url,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client, base: &Url) -> Result<Self> {
        Ok(Self {
            client,
            url: base.join("execute").context("invalid executor url")?,
        })
    }
}

#[derive(serde::Serialize)]
struct ExecuteRequest<'a> {
    item_id: &'a str,
    recipient: &'a str,
}

#[derive(serde::Deserialize)]
struct ExecuteResponse {
    tx_ref: String,
}

#[async_trait::async_trait]
impl OnchainExecuting for HttpExecutor {
    async fn execute(&self, item_id: &ItemId, recipient: &UserId) -> Result<Execution> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&ExecuteRequest {
                item_id: item_id.as_str(),
                recipient: recipient.as_str(),
            })
            .send()
            .await
            .context("executor unreachable")?
            .error_for_status()
            .context("executor reported a failed execution")?
            .json::<ExecuteResponse>()
            .await
            .context("malformed executor response")?;
        Ok(Execution {
            tx_ref: response.tx_ref,
        })
    }
}

pub struct HttpDelivery {
    client: reqwest::Client,
    url: Url,
}

impl HttpDelivery {
    pub fn new(client: reqwest::Client, base: &Url) -> Result<Self> {
        Ok(Self {
            client,
            url: base.join("deliver").context("invalid delivery url")?,
        })
    }
}

#[derive(serde::Serialize)]
struct DeliverRequest<'a> {
    order_id: i64,
    user_id: &'a str,
    item_id: &'a str,
    tx_ref: Option<&'a str>,
}

#[async_trait::async_trait]
impl Delivering for HttpDelivery {
    async fn deliver(&self, order: &Order) -> Result<()> {
        self.client
            .post(self.url.clone())
            .json(&DeliverRequest {
                order_id: order.id.0,
                user_id: order.user_id.as_str(),
                item_id: order.item_id.as_str(),
                tx_ref: order.tx_ref.as_deref(),
            })
            .send()
            .await
            .context("delivery service unreachable")?
            .error_for_status()
            .context("delivery service refused the order")?;
        Ok(())
    }
}
