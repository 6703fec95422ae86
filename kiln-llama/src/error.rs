/// Errors that can occur on the engine surface.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    /// Tokenization failed.
    #[error("tokenization failed: {0}")]
    TokenizeFailed(String),

    /// Token-to-piece conversion failed.
    #[error("token {0} is out of the vocabulary range")]
    UnknownToken(crate::LlamaToken),

    /// Decode failed fatally (negative engine return code).
    #[error("decode failed with code {0}")]
    DecodeFailed(i32),

    /// Decode could not find free space in the KV cache (positive engine
    /// return code).  The caller may retry with a smaller batch.
    #[error("no free space in the KV cache (code {0})")]
    KvPressure(i32),

    /// Batch is full - cannot add more tokens.
    #[error("batch is full, cannot add more tokens")]
    BatchFull,

    /// Tokens cannot be appended to a batch carrying an embedding payload.
    #[error("cannot add tokens to an embedding batch")]
    EmbeddingPayload,

    /// The engine has no image encoder attached.
    #[error("no image encoder available")]
    NoImageEncoder,

    /// Image encoding failed.
    #[error("image encoding failed: {0}")]
    ImageEncodeFailed(String),

    /// Failed to load the model.
    #[error("failed to load model: {0}")]
    ModelLoadFailed(String),
}
