use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::{Category, ConversationState, ExchangeId};

/// External text-completion collaborator that phrases the next question.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextCompletionProvider: Send + Sync {
    async fn generate(&self, prompt: &str, context_chunks: &[String]) -> anyhow::Result<String>;
}

/// What the controller wants asked next. The answer to it will be stored
/// under `exchange_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextQuestion {
    pub exchange_id: ExchangeId,
    pub state: ConversationState,
    pub category: Option<Category>,
    pub is_followup: bool,
    /// Template text; the fallback when no renderer is available
    pub prompt: String,
    pub context: Vec<String>,
}

const OPENING: &str =
    "Let's start by understanding your product idea. What problem does your product solve?";

fn category_templates(category: Category) -> &'static [&'static str] {
    match category {
        Category::Functionality => &[
            "What are the main features users will interact with?",
            "How will users accomplish their primary goals with your product?",
            "What makes your product's functionality unique or innovative?",
        ],
        Category::Users => &[
            "Who are the primary users of your product?",
            "What expertise level do your users have (beginner, intermediate, expert)?",
            "What are the key characteristics of your target users?",
        ],
        Category::Demographics => &[
            "What is the age range of your target audience?",
            "What geographic regions are you primarily targeting?",
            "Are there specific demographic factors important for your product?",
        ],
        Category::Design => &[
            "Do you have specific design preferences (modern, minimal, bold, playful)?",
            "Are there any brand colors or style guidelines you'd like to follow?",
            "What mood or feeling should the design convey to users?",
        ],
        Category::Market => &[
            "Who are your main competitors in the market?",
            "What is your unique value proposition compared to alternatives?",
            "What market segment or niche are you targeting?",
        ],
        Category::Technical => &[
            "Do you have any technical stack preferences or requirements?",
            "What are your scalability expectations (users, data volume)?",
            "Are there specific integrations or APIs you need to support?",
        ],
    }
}

fn followup_templates(category: Category) -> &'static [&'static str] {
    match category {
        Category::Functionality => &[
            "Can you give me a specific example of how that would work?",
            "What would be the most important aspect of that feature?",
            "How do you envision users interacting with that?",
        ],
        Category::Users => &[
            "Can you describe a typical user's background or expertise?",
            "What would motivate someone to use your product?",
            "What problems do these users currently face?",
        ],
        Category::Demographics => &[
            "Are there specific characteristics that define your target audience?",
            "Which demographic factors are most relevant to your product?",
            "How would you reach this audience?",
        ],
        Category::Design => &[
            "What emotion should users feel when using your product?",
            "Are there any design examples you admire?",
            "What should be the visual focus of the interface?",
        ],
        Category::Market => &[
            "What makes your approach different from existing solutions?",
            "Who would be your ideal first customers?",
            "What's the key benefit users would pay for?",
        ],
        Category::Technical => &[
            "What technical capabilities are critical for your product?",
            "Do you have any performance or security requirements?",
            "What platforms or devices need to be supported?",
        ],
    }
}

const REVIEW_TEMPLATES: &[&str] = &[
    "Let me summarize what we've discussed. Does this capture your vision accurately?",
    "Is there anything important we haven't covered yet?",
    "Would you like to clarify or expand on any aspect?",
];

const GENERIC_FOLLOWUP: &str = "Could you tell me more about that?";

/// Template text for the question at `state`. `asked` is how many questions
/// were already issued in that state and rotates through the templates.
/// The very first question of a session uses the opening line.
pub fn template_for(state: ConversationState, is_followup: bool, asked: usize) -> &'static str {
    let pick = |templates: &'static [&'static str]| templates[asked % templates.len()];
    match state {
        ConversationState::Category(Category::Functionality) if asked == 0 && !is_followup => OPENING,
        ConversationState::Category(c) if is_followup => pick(followup_templates(c)),
        ConversationState::Category(c) => pick(category_templates(c)),
        ConversationState::Review => pick(REVIEW_TEMPLATES),
        ConversationState::Start | ConversationState::Complete => GENERIC_FOLLOWUP,
    }
}

/// Phrases a [`NextQuestion`] through the completion provider, falling back
/// to the template text on error, timeout or an empty reply.
pub struct QuestionRenderer {
    provider: Option<Arc<dyn TextCompletionProvider>>,
    timeout: Duration,
}

impl QuestionRenderer {
    pub fn new(provider: Arc<dyn TextCompletionProvider>, timeout: Duration) -> Self {
        Self {
            provider: Some(provider),
            timeout,
        }
    }

    /// Always returns the template text.
    pub fn templates_only() -> Self {
        Self {
            provider: None,
            timeout: Duration::from_secs(0),
        }
    }

    fn build_prompt(question: &NextQuestion) -> String {
        let topic = question
            .category
            .map(|c| c.as_str())
            .unwrap_or("review");
        let mut prompt = format!(
            "You are a product investigator conducting a discovery interview.\n\
             Current investigation category: {}\n",
            topic
        );
        if question.is_followup {
            prompt.push_str(
                "The user's last answer was short or vague. Ask one concise follow-up \
                 question (under 20 words) that digs deeper into it.\n",
            );
        } else {
            prompt.push_str("Ask one concise question (under 20 words) about this category.\n");
        }
        prompt.push_str(&format!("Suggested wording: {}\n", question.prompt));
        prompt.push_str("Reply with the question only.");
        prompt
    }

    pub async fn render(&self, question: &NextQuestion) -> String {
        let Some(provider) = &self.provider else {
            return question.prompt.clone();
        };

        let prompt = Self::build_prompt(question);
        match tokio::time::timeout(self.timeout, provider.generate(&prompt, &question.context)).await {
            Ok(Ok(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    warn!("Completion returned empty text, using template");
                    return question.prompt.clone();
                }
                debug!("Rendered question for exchange {}", question.exchange_id);
                if text.ends_with('?') {
                    text.to_string()
                } else {
                    format!("{}?", text)
                }
            }
            Ok(Err(e)) => {
                warn!("Question generation failed, using template: {:#}", e);
                question.prompt.clone()
            }
            Err(_) => {
                warn!("Question generation timed out after {:?}, using template", self.timeout);
                question.prompt.clone()
            }
        }
    }
}
