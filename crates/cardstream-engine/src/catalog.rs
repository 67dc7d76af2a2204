//! Content catalog: the seam between the streaming service and whatever
//! produces card bodies.

use async_trait::async_trait;
use serde_json::{json, Value};

use cardstream_types::{GenerationRequest, Layout, Result, StreamError};

/// One card chosen for a session, before its body exists.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCard {
    /// Section name, sent as the skeleton card's `type`.
    pub section: String,
    pub layout: Layout,
    /// Used when the request asks for images.
    pub image_prompt: String,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    fn topics(&self) -> Vec<String>;

    /// Pick the cards for a request. Must fail fast, without I/O, on an
    /// unknown topic.
    fn plan(&self, request: &GenerationRequest) -> Result<Vec<PlannedCard>>;

    /// Produce one card's body.
    async fn generate(&self, topic: &str, card: &PlannedCard) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// StaticCatalog
// ---------------------------------------------------------------------------

struct Section {
    key: &'static str,
    layout: Layout,
    content: Value,
}

impl Section {
    fn new(key: &'static str, layout: Layout, content: Value) -> Self {
        Self {
            key,
            layout,
            content,
        }
    }

    /// The section's own prompt, or one derived from its title.
    fn image_prompt(&self, topic: &str) -> String {
        if let Some(prompt) = self.content.get("imagePrompt").and_then(Value::as_str) {
            return prompt.to_string();
        }
        let subject = self
            .content
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(topic);
        format!("{subject}, {} illustration, professional presentation style", self.key)
    }
}

/// Deterministic catalog of three built-in topics, six sections each.
pub struct StaticCatalog {
    topics: Vec<(String, Vec<Section>)>,
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self {
            topics: vec![
                ("AI in Product Discovery".into(), product_discovery()),
                ("Digital Marketing Trends 2025".into(), marketing_trends()),
                ("Remote Team Management".into(), remote_teams()),
            ],
        }
    }

    fn sections(&self, topic: &str) -> Result<&[Section]> {
        self.topics
            .iter()
            .find(|(name, _)| name == topic)
            .map(|(_, sections)| sections.as_slice())
            .ok_or_else(|| StreamError::UnknownTopic {
                topic: topic.to_string(),
                available: self.topics(),
            })
    }
}

#[async_trait]
impl ContentSource for StaticCatalog {
    fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|(name, _)| name.clone()).collect()
    }

    fn plan(&self, request: &GenerationRequest) -> Result<Vec<PlannedCard>> {
        let sections = self.sections(&request.topic)?;
        let planned: Vec<PlannedCard> = sections
            .iter()
            .filter(|s| match &request.layouts {
                Some(layouts) => layouts.contains(&s.layout),
                None => true,
            })
            .take(request.card_count)
            .map(|s| PlannedCard {
                section: s.key.to_string(),
                layout: s.layout,
                image_prompt: s.image_prompt(&request.topic),
            })
            .collect();

        if planned.is_empty() {
            return Err(StreamError::InvalidRequest(format!(
                "No sections of '{}' match the requested layouts",
                request.topic
            )));
        }
        Ok(planned)
    }

    async fn generate(&self, topic: &str, card: &PlannedCard) -> Result<Value> {
        self.sections(topic)?
            .iter()
            .find(|s| s.key == card.section)
            .map(|s| s.content.clone())
            .ok_or_else(|| StreamError::Other(format!("No section '{}' in '{topic}'", card.section)))
    }
}

fn product_discovery() -> Vec<Section> {
    vec![
        Section::new(
            "title",
            Layout::HeroOverlay,
            json!({
                "title": "AI in Product Discovery",
                "subtitle": "Transforming Ideas into Innovation",
                "kicker": "A Modern Approach",
                "imagePrompt": "abstract futuristic AI technology background, professional presentation style"
            }),
        ),
        Section::new(
            "objectives",
            Layout::NumberedList,
            json!({
                "intro": "By the end of this session, you'll be able to:",
                "items": [
                    "Identify customer problems using AI on qualitative data",
                    "Generate diverse product ideas with AI assistance",
                    "Refine and select top ideas using AI scoring",
                    "Validate assumptions with AI-powered user research",
                    "Build a data-driven product roadmap"
                ]
            }),
        ),
        Section::new(
            "process",
            Layout::Grid,
            json!({
                "title": "The AI-Powered Discovery Process",
                "cells": [
                    {"title": "1. Problem Identification", "body": "Use AI to analyze customer feedback, support tickets, and user interviews to uncover pain points"},
                    {"title": "2. Idea Generation", "body": "Leverage AI to brainstorm solutions, explore adjacent opportunities, and identify market gaps"},
                    {"title": "3. Concept Validation", "body": "Score and prioritize ideas using AI-driven impact analysis and feasibility assessment"},
                    {"title": "4. Implementation", "body": "Build MVPs with AI-assisted prototyping and continuous user feedback loops"}
                ]
            }),
        ),
        Section::new(
            "benefits",
            Layout::ContentBullets,
            json!({
                "title": "Why AI-Powered Discovery?",
                "bullets": [
                    "Process 100x more customer data than manual analysis",
                    "Reduce time-to-insight from weeks to hours",
                    "Uncover hidden patterns in user behavior",
                    "Generate more diverse solution alternatives",
                    "Make data-driven prioritization decisions",
                    "Scale discovery across multiple products"
                ],
                "footnote": "Based on industry research and case studies from leading product teams"
            }),
        ),
        Section::new(
            "methodology",
            Layout::Split,
            json!({
                "title": "AI-Assisted Research Methodology",
                "body": [
                    "Start with qualitative data collection from multiple sources",
                    "Use NLP to extract themes and sentiment from text",
                    "Apply machine learning for pattern recognition",
                    "Generate hypotheses using AI ideation tools",
                    "Validate findings with quantitative analysis"
                ],
                "imagePrompt": "data visualization and analytics dashboard, modern UI design"
            }),
        ),
        Section::new(
            "conclusion",
            Layout::Hero,
            json!({
                "title": "Ready to Transform Your Product Discovery?",
                "subtitle": "Start leveraging AI today",
                "cta": {"label": "Get Started", "href": "#"},
                "imagePrompt": "success and innovation concept, upward growth arrows"
            }),
        ),
    ]
}

fn marketing_trends() -> Vec<Section> {
    vec![
        Section::new(
            "title",
            Layout::HeroOverlay,
            json!({
                "title": "Digital Marketing Trends 2025",
                "subtitle": "What Every Marketer Needs to Know",
                "kicker": "Stay Ahead of the Curve",
                "imagePrompt": "digital marketing and technology, modern abstract background"
            }),
        ),
        Section::new(
            "objectives",
            Layout::NumberedList,
            json!({
                "intro": "Key trends shaping digital marketing:",
                "items": [
                    "AI-powered personalization at scale",
                    "Privacy-first marketing strategies",
                    "Interactive and immersive content",
                    "Voice and visual search optimization",
                    "Sustainable and ethical marketing"
                ]
            }),
        ),
        Section::new(
            "trends",
            Layout::Grid,
            json!({
                "title": "Top Marketing Technologies",
                "cells": [
                    {"title": "AI & Automation", "body": "Machine learning for predictive analytics, chatbots, and automated campaign optimization"},
                    {"title": "AR/VR Experiences", "body": "Immersive product demonstrations and virtual showrooms for enhanced engagement"},
                    {"title": "Web3 & Blockchain", "body": "NFT marketing, cryptocurrency payments, and decentralized brand communities"},
                    {"title": "Zero-Party Data", "body": "Direct customer data collection through interactive experiences and preference centers"}
                ]
            }),
        ),
        Section::new(
            "strategies",
            Layout::ContentBullets,
            json!({
                "title": "Winning Strategies for 2025",
                "bullets": [
                    "Focus on first-party data collection and customer consent",
                    "Invest in video content across all platforms",
                    "Build community-driven marketing campaigns",
                    "Optimize for conversational and voice search",
                    "Embrace sustainability in brand messaging",
                    "Create personalized omnichannel experiences"
                ],
                "footnote": "Insights from leading marketing research firms"
            }),
        ),
        Section::new(
            "channels",
            Layout::Split,
            json!({
                "title": "Evolving Channel Mix",
                "body": [
                    "Social commerce continues to grow exponentially",
                    "Short-form video dominates attention economy",
                    "Podcast advertising reaches mainstream adoption",
                    "Email marketing remains highest ROI channel",
                    "Connected TV advertising becomes accessible to SMBs"
                ],
                "imagePrompt": "social media and digital channels icons, colorful modern design"
            }),
        ),
        Section::new(
            "action",
            Layout::Hero,
            json!({
                "title": "Adapt or Fall Behind",
                "subtitle": "Update your marketing strategy today",
                "cta": {"label": "Download Guide", "href": "#"},
                "imagePrompt": "forward progress and innovation concept"
            }),
        ),
    ]
}

fn remote_teams() -> Vec<Section> {
    vec![
        Section::new(
            "title",
            Layout::HeroOverlay,
            json!({
                "title": "Remote Team Management",
                "subtitle": "Building High-Performance Distributed Teams",
                "kicker": "The Future of Work",
                "imagePrompt": "remote work and collaboration, diverse team members on video calls"
            }),
        ),
        Section::new(
            "objectives",
            Layout::NumberedList,
            json!({
                "intro": "Essential skills for remote team leaders:",
                "items": [
                    "Establish clear communication protocols",
                    "Build trust in distributed environments",
                    "Maintain team culture across time zones",
                    "Measure performance based on outcomes",
                    "Foster collaboration without proximity"
                ]
            }),
        ),
        Section::new(
            "challenges",
            Layout::Grid,
            json!({
                "title": "Common Remote Challenges",
                "cells": [
                    {"title": "Communication Gaps", "body": "Reduced informal interactions and potential for misunderstandings in async communication"},
                    {"title": "Timezone Coordination", "body": "Scheduling meetings and managing real-time collaboration across global teams"},
                    {"title": "Isolation & Burnout", "body": "Remote workers feeling disconnected, difficulty separating work from personal life"},
                    {"title": "Technology Barriers", "body": "Tool fatigue, security concerns, and inconsistent home office setups"}
                ]
            }),
        ),
        Section::new(
            "solutions",
            Layout::ContentBullets,
            json!({
                "title": "Best Practices for Success",
                "bullets": [
                    "Over-communicate expectations and provide regular feedback",
                    "Invest in the right collaboration tools and training",
                    "Schedule regular 1-on-1s and team bonding activities",
                    "Document everything for async knowledge sharing",
                    "Respect boundaries and encourage work-life balance",
                    "Celebrate wins and maintain visibility of achievements"
                ],
                "footnote": "Based on research from remote-first companies"
            }),
        ),
        Section::new(
            "tools",
            Layout::Split,
            json!({
                "title": "Remote Team Tech Stack",
                "body": [
                    "Video conferencing: Zoom, Google Meet, or Microsoft Teams",
                    "Async communication: Slack, Discord, or Microsoft Teams",
                    "Project management: Asana, Trello, Jira, or Linear",
                    "Documentation: Notion, Confluence, or Google Workspace",
                    "Time tracking: Toggl, Harvest, or Clockify"
                ],
                "imagePrompt": "technology tools and software interface, modern digital workspace"
            }),
        ),
        Section::new(
            "future",
            Layout::Hero,
            json!({
                "title": "Master Remote Leadership",
                "subtitle": "Build resilient distributed teams",
                "cta": {"label": "Learn More", "href": "#"},
                "imagePrompt": "team success and collaboration concept"
            }),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_three_topics() {
        let catalog = StaticCatalog::new();
        assert_eq!(
            catalog.topics(),
            vec![
                "AI in Product Discovery",
                "Digital Marketing Trends 2025",
                "Remote Team Management"
            ]
        );
    }

    #[test]
    fn plan_takes_sections_in_order() {
        let catalog = StaticCatalog::new();
        let plan = catalog
            .plan(&GenerationRequest::new("AI in Product Discovery", 3))
            .unwrap();
        let sections: Vec<&str> = plan.iter().map(|c| c.section.as_str()).collect();
        assert_eq!(sections, vec!["title", "objectives", "process"]);
        assert_eq!(plan[0].layout, Layout::HeroOverlay);
        assert!(plan[0].image_prompt.starts_with("abstract futuristic AI"));
        assert_eq!(
            plan[1].image_prompt,
            "AI in Product Discovery, objectives illustration, professional presentation style"
        );
        assert!(plan[2]
            .image_prompt
            .starts_with("The AI-Powered Discovery Process, process"));
    }

    #[test]
    fn plan_caps_at_available_sections() {
        let catalog = StaticCatalog::new();
        let plan = catalog
            .plan(&GenerationRequest::new("Remote Team Management", 20))
            .unwrap();
        assert_eq!(plan.len(), 6);
    }

    #[test]
    fn plan_rejects_unknown_topic() {
        let catalog = StaticCatalog::new();
        let err = catalog
            .plan(&GenerationRequest::new("Nonexistent Topic", 3))
            .unwrap_err();
        match err {
            StreamError::UnknownTopic { topic, available } => {
                assert_eq!(topic, "Nonexistent Topic");
                assert_eq!(available.len(), 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn layout_filter() {
        let catalog = StaticCatalog::new();
        let mut request = GenerationRequest::new("Digital Marketing Trends 2025", 6);
        request.layouts = Some(vec![Layout::Hero, Layout::Grid]);
        let plan = catalog.plan(&request).unwrap();
        let layouts: Vec<Layout> = plan.iter().map(|c| c.layout).collect();
        assert_eq!(layouts, vec![Layout::Grid, Layout::Hero]);

        request.layouts = Some(vec![]);
        assert!(matches!(
            catalog.plan(&request),
            Err(StreamError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn generate_returns_section_body() {
        let catalog = StaticCatalog::new();
        let plan = catalog
            .plan(&GenerationRequest::new("AI in Product Discovery", 1))
            .unwrap();
        let body = catalog
            .generate("AI in Product Discovery", &plan[0])
            .await
            .unwrap();
        assert_eq!(body["title"], "AI in Product Discovery");
        assert_eq!(body["kicker"], "A Modern Approach");
    }

    #[test]
    fn every_topic_uses_all_six_layouts() {
        let catalog = StaticCatalog::new();
        for topic in catalog.topics() {
            let plan = catalog.plan(&GenerationRequest::new(&topic, 6)).unwrap();
            for layout in Layout::ALL {
                assert!(plan.iter().any(|c| c.layout == layout), "{topic} lacks {layout:?}");
            }
        }
    }
}
