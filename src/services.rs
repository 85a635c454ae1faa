use async_trait::async_trait;

/// Opaque signing collaborator. Key generation and signature schemes live
/// outside this crate; the client only needs a public identity to register
/// under and a way to sign a blob with secret material it never inspects.
pub trait SigningService: Send + Sync {
    /// The public address this client registers and converses as.
    fn public_identity(&self) -> String;

    fn sign(&self, message: &[u8], secret: &[u8]) -> Vec<u8>;
}

/// Balance and transaction submission over a separate request/reply channel.
/// Consumed, not implemented, by this crate.
#[async_trait]
pub trait LedgerService: Send + Sync {
    async fn query_balance(&self, address: &str) -> crate::Result<u64>;

    /// Submits a signed transaction, returning its identifier.
    async fn submit_transaction(&self, signed: Vec<u8>) -> crate::Result<String>;
}
