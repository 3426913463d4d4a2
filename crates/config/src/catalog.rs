//! Built-in catalog of supported LLM providers.
//!
//! Every provider speaks the OpenAI-compatible chat completions protocol;
//! they differ in endpoint, default models and which environment variable
//! holds the key.

use termagent_core::Capabilities;

/// A model suggested by `/models`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ModelKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Coding,
    General,
    Vision,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Coding => "coding",
            Self::General => "general",
            Self::Vision => "vision",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    pub id: &'static str,
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub vision_model: &'static str,
    /// Environment variable holding this provider's API key
    pub env_key: &'static str,
    /// Key used when none is configured (local servers ignore it)
    pub default_key: Option<&'static str>,
    pub capabilities: Capabilities,
    pub models: &'static [ModelInfo],
}

const FULL: Capabilities = Capabilities {
    tools: true,
    vision: true,
    streaming: true,
};

const fn model(name: &'static str, description: &'static str, kind: ModelKind) -> ModelInfo {
    ModelInfo {
        name,
        description,
        kind,
    }
}

pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        id: "ollama",
        base_url: "http://localhost:11434/v1",
        default_model: "qwen2.5-coder:7b",
        vision_model: "llava:7b",
        env_key: "OLLAMA_API_KEY",
        default_key: Some("ollama"),
        capabilities: FULL,
        models: &[
            model("qwen2.5-coder:7b", "Best for coding", ModelKind::Coding),
            model("qwen2.5-coder:14b", "Better coding, slower", ModelKind::Coding),
            model("codellama:7b", "Good for code", ModelKind::Coding),
            model("deepseek-coder:6.7b", "Fast coding", ModelKind::Coding),
            model("llama3:8b", "General purpose", ModelKind::General),
            model("mistral:7b", "Fast and smart", ModelKind::General),
            model("llava:7b", "Vision and text", ModelKind::Vision),
            model("llava:13b", "Better vision", ModelKind::Vision),
        ],
    },
    ProviderSpec {
        id: "gemini",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        default_model: "gemini-2.0-flash",
        vision_model: "gemini-2.0-flash",
        env_key: "GEMINI_API_KEY",
        default_key: None,
        capabilities: FULL,
        models: &[
            model("gemini-2.0-flash", "Best and fast", ModelKind::Coding),
            model("gemini-1.5-flash", "Fast, good for code", ModelKind::Coding),
            model("gemini-1.5-pro", "Most capable", ModelKind::General),
        ],
    },
    ProviderSpec {
        id: "mistral",
        base_url: "https://api.mistral.ai/v1",
        default_model: "open-mistral-nemo",
        vision_model: "pixtral-12b-2409",
        env_key: "MISTRAL_API_KEY",
        default_key: None,
        capabilities: FULL,
        models: &[
            model("open-mistral-nemo", "Free open source", ModelKind::Coding),
            model("open-mistral-7b", "Free 7B model", ModelKind::General),
            model("open-mixtral-8x7b", "Free Mixtral", ModelKind::General),
            model("mistral-small-latest", "Paid, fast", ModelKind::Coding),
            model("mistral-large-latest", "Paid, powerful", ModelKind::General),
            model("pixtral-12b-2409", "Vision model", ModelKind::Vision),
        ],
    },
    ProviderSpec {
        id: "openai",
        base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o-mini",
        vision_model: "gpt-4o-mini",
        env_key: "OPENAI_API_KEY",
        default_key: None,
        capabilities: FULL,
        models: &[
            model("gpt-4o", "Best overall", ModelKind::General),
            model("gpt-4o-mini", "Fast and cheap, good for code", ModelKind::Coding),
            model("gpt-4-turbo", "Powerful, expensive", ModelKind::General),
            model("gpt-3.5-turbo", "Cheapest, basic", ModelKind::General),
        ],
    },
    ProviderSpec {
        id: "groq",
        base_url: "https://api.groq.com/openai/v1",
        default_model: "llama-3.3-70b-versatile",
        vision_model: "llama-3.2-90b-vision-preview",
        env_key: "GROQ_API_KEY",
        default_key: None,
        capabilities: FULL,
        models: &[
            model("llama-3.3-70b-versatile", "Best overall, very fast", ModelKind::Coding),
            model("llama-3.1-8b-instant", "Fastest, good for code", ModelKind::Coding),
            model("llama-3.2-90b-vision-preview", "Vision and text", ModelKind::Vision),
            model("mixtral-8x7b-32768", "Good balance", ModelKind::General),
            model("gemma2-9b-it", "Google's model", ModelKind::General),
        ],
    },
];

/// Look up a provider by id (case-insensitive).
pub fn lookup(id: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|p| p.id.eq_ignore_ascii_case(id))
}

/// Ids of all known providers, in catalog order.
pub fn provider_ids() -> Vec<&'static str> {
    PROVIDERS.iter().map(|p| p.id).collect()
}
