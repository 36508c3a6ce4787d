/// Constants module to avoid magic numbers in the codebase

// Engine Configuration
pub const DEFAULT_ENGINE_URL: &str = "http://localhost:8000";
pub const DEFAULT_ENGINE_API_KEY_ENV: &str = "JARVIS_ENGINE_API_KEY";

// Timeouts
pub const HTTP_REQUEST_TIMEOUT_SECS: u64 = 600; // Long generations on small devices
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const SEARCH_TIMEOUT_SECS: u64 = 30;

// Model Artifacts
pub const LITE_WEIGHTS: &str = "qwen2.5-3b-instruct-q4_K_M";
pub const MAX_WEIGHTS: &str = "qwen2.5-4b-instruct-q4_K_M";
pub const MODEL_LIB_PREFIX: &str = "mlc-llm-libs";

// Default Generation Configuration
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_MAX_TOKENS: usize = 512;

// Warm-up generation run after a reload
pub const WARMUP_PROMPT: &str = "Hello";
pub const WARMUP_MAX_TOKENS: usize = 5;

// Throughput Estimation
pub const CHARS_PER_TOKEN: usize = 4;
pub const MIN_ELAPSED_SECS: f64 = 0.001;

// Load progress never reaches 1.0 before the load has succeeded
pub const MAX_PENDING_PROGRESS: f64 = 0.99;

// Network Gate
pub const DEFAULT_AUDIT_CAPACITY: usize = 256;
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "api.openai.com",
    "api.anthropic.com",
    "api.together.xyz",
    "huggingface.co",
];

// Search
pub const QUICK_SEARCH_RESULTS: usize = 3;
pub const DEEP_RESEARCH_RESULTS: usize = 8;
