/// Immutable engine configuration, injected at construction.
///
/// Tests and alternate deployments swap endpoints and budgets here instead of
/// patching globals; nothing in the engine reads the process environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the primary inference endpoint.
    pub api_base: String,
    /// Conversational/analysis model, addressed via `:generateContent`.
    pub analysis_model: String,
    /// Dedicated image-generation model, addressed via `:predict`.
    pub image_model: String,
    /// Public image-synthesis service used as the rendering fallback.
    pub fallback_image_base: String,
    /// Longer image edge above which uploads are downscaled. Never upscales.
    pub max_image_dimension: u32,
    /// JPEG re-encode quality on the 0-100 scale.
    pub jpeg_quality: u8,
    /// Retry budget for `generate` calls.
    pub generate_retry_budget: u32,
    /// Retry budget for `predict` calls. Image generation is not retried.
    pub predict_retry_budget: u32,
    /// First backoff delay; doubled on every retry.
    pub backoff_base_ms: u64,
    /// Edge length of the square fallback-rendered spirit image.
    pub spirit_image_size: u32,
    /// Display name used when the description stage yields no parenthetical.
    pub spirit_name_placeholder: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            analysis_model: "gemini-2.0-flash".to_string(),
            image_model: "imagen-3.0-generate-002".to_string(),
            fallback_image_base: "https://image.pollinations.ai/prompt".to_string(),
            max_image_dimension: 1600,
            jpeg_quality: 80,
            generate_retry_budget: 2,
            predict_retry_budget: 0,
            backoff_base_ms: 2000,
            spirit_image_size: 1024,
            spirit_name_placeholder: "Guardian Spirit".to_string(),
        }
    }
}
