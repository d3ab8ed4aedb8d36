//! Prompt templates for valuation and tiebreaker calls.
//!
//! Domain logic for rendering prompts. Provider-agnostic.

use crate::gateway::{ImageData, Message};

// =============================================================================
// Rendered prompt
// =============================================================================

/// Rendered prompt ready for a provider.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    /// Messages with images attached to the user turn.
    pub fn to_messages_with_images(&self, images: Vec<ImageData>) -> Vec<Message> {
        vec![
            Message::system(&self.system),
            Message::user(&self.user).with_images(images),
        ]
    }

    /// Variant for a provider that cannot see images: drops the photo line and
    /// adds the text-only notice ahead of the closing instruction.
    pub fn text_only(&self) -> PromptInstance {
        if self.user.contains(TEXT_ONLY_NOTICE) {
            return self.clone();
        }
        let mut parts: Vec<&str> = self
            .user
            .split("\n\n")
            .filter(|p| !p.contains(PHOTOS_ATTACHED))
            .collect();
        let at = parts.len().saturating_sub(1);
        parts.insert(at, TEXT_ONLY_NOTICE);
        PromptInstance {
            template_slug: self.template_slug.clone(),
            system: self.system.clone(),
            user: parts.join("\n\n"),
        }
    }

    /// Stable hash of the rendered prompt, for audit traces.
    pub fn hash(&self) -> String {
        blake3::hash(format!("{}\n{}", self.system, self.user).as_bytes())
            .to_hex()
            .to_string()
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Valuation prompt
// =============================================================================

pub const VALUATION_SLUG: &str = "valuation_v3";
pub const TIEBREAKER_SLUG: &str = "tiebreaker_v2";

const VALUATION_SYSTEM: &str = r#"You are an expert resale appraiser. You estimate what an item will realistically sell for on the secondhand market (sold listings, not asking prices) and decide whether buying it for resale is worthwhile.

Respond with ONLY a JSON object. No markdown, no code fences, no commentary before or after.
Schema:
{"itemName": string, "estimatedValue": number (USD, >= 0), "decision": "BUY" | "SELL", "valuation_factors": [short strings, most important first], "summary_reasoning": string, "confidence": number in [0,1]}
BUY means the item can be resold at a profit over the asking price (or is clearly undervalued if no price is given). SELL means pass on it.
If you are uncertain, still answer and lower your confidence."#;

const PHOTOS_ATTACHED: &str = "photo(s) of the item are attached";

const TEXT_ONLY_NOTICE: &str = "You cannot see the photos for this item. Work from the name and description alone, state any identification assumptions in valuation_factors, and keep confidence modest unless the listing text is unambiguous.";

/// Everything a valuation prompt can mention.
#[derive(Debug, Clone, Default)]
pub struct ValuationPromptInput<'a> {
    pub item_name_hint: &'a str,
    pub description: Option<&'a str>,
    pub category: &'a str,
    pub asking_price: Option<f64>,
    pub location_hint: Option<&'a str>,
    pub image_count: usize,
    /// True when the receiving provider cannot see images.
    pub text_only: bool,
}

pub fn render_valuation_prompt(input: &ValuationPromptInput<'_>) -> PromptInstance {
    let mut parts: Vec<String> = Vec::new();

    let name = input.item_name_hint.trim();
    if name.is_empty() {
        parts.push("<item_name>unknown; identify it from the photos</item_name>".to_string());
    } else {
        parts.push(format!("<item_name>{}</item_name>", escape_xml_chars(name)));
    }
    if let Some(desc) = input.description.map(str::trim).filter(|d| !d.is_empty()) {
        parts.push(format!(
            "<item_description>\n{}\n</item_description>",
            escape_xml_chars(desc)
        ));
    }
    parts.push(format!(
        "<detected_category>{}</detected_category>",
        escape_xml_chars(input.category)
    ));
    if let Some(guidance) = category_guidance(input.category) {
        parts.push(format!("<category_guidance>{guidance}</category_guidance>"));
    }
    if let Some(price) = input.asking_price {
        parts.push(format!("<asking_price>${price:.2}</asking_price>"));
    }
    if let Some(loc) = input.location_hint.map(str::trim).filter(|l| !l.is_empty()) {
        parts.push(format!("<location>{}</location>", escape_xml_chars(loc)));
    }

    if input.text_only {
        parts.push(TEXT_ONLY_NOTICE.to_string());
    } else if input.image_count > 0 {
        parts.push(format!(
            "{} {PHOTOS_ATTACHED}. Use condition, markings and labels visible in them.",
            input.image_count
        ));
    }

    parts.push("Return the JSON object now.\njson:".to_string());

    PromptInstance {
        template_slug: VALUATION_SLUG.to_string(),
        system: VALUATION_SYSTEM.to_string(),
        user: parts.join("\n\n"),
    }
}

/// Category-specific pricing cues steering each provider.
pub fn category_guidance(category: &str) -> Option<&'static str> {
    Some(match category {
        "trading_cards" => "Value by set, card number, edition and grade (PSA/BGS/CGC). Raw cards sell well below graded copies.",
        "video_games" => "Distinguish loose, complete-in-box and sealed. Region and console generation matter.",
        "vinyl_records" => "Pressing matters: check catalog number, first pressing markers, and sleeve/vinyl condition grades.",
        "media" => "Most mass-market DVDs, CDs and VHS tapes are worth little; only sealed, rare or cult titles command premiums.",
        "sneakers" => "Price by exact colorway, size and whether deadstock. Authenticity concerns lower confidence.",
        "streetwear" => "Hype brands resell on drop, season and size; check tags for authenticity.",
        "clothing" => "Generic apparel rarely resells above a few dollars unless designer or vintage.",
        "electronics" => "Model number and working condition dominate; older generations depreciate quickly.",
        "watches" => "Reference number, movement and box/papers drive value.",
        "jewelry" => "Metal content and hallmarks set a floor; designer signatures add premiums.",
        "handbags" => "Designer authenticity and condition of corners/hardware dominate price.",
        "lego" => "Sealed sets and retired themes command premiums; used sets sell by completeness.",
        "toys" => "Vintage, boxed and complete toys sell far above loose modern toys.",
        "collectibles" => "Edition size, condition of box and exclusivity drive demand.",
        "books" => "First editions, signed copies and textbooks can be valuable; most paperbacks are not.",
        "comics" => "Key issues and CGC grade drive value.",
        "coins" => "Mint year, mint mark, grade and metal content determine value.",
        "vehicles" => "Year, make, model, mileage and title status drive value.",
        "sports_memorabilia" => "Authentication (COA) and player significance drive value.",
        "cameras" => "Lens mount, shutter count and fungus/haze in lenses matter.",
        "musical_instruments" => "Brand, country of manufacture and playability matter.",
        "furniture" => "Mid-century and designer pieces resell well; bulky generic furniture does not.",
        "tools" => "Brand-name power tools with batteries resell best.",
        "art" => "Artist attribution, medium and provenance drive value.",
        _ => return None,
    })
}

// =============================================================================
// Tiebreaker prompt
// =============================================================================

const TIEBREAKER_SYSTEM: &str = r#"You are the deciding appraiser on a panel that split almost evenly. Weigh the panel's answers critically: either adopt the single most defensible panel answer, or give your own adjusted judgment.

Respond with ONLY a JSON object:
{"selected_provider": provider id you agree with or null, "itemName": string, "estimatedValue": number, "decision": "BUY" | "SELL", "valuation_factors": [strings], "summary_reasoning": string, "confidence": number in [0,1]}"#;

/// Compact view of one primary vote for the tiebreaker digest.
#[derive(Debug, Clone)]
pub struct VoteDigestLine<'a> {
    pub provider_id: &'a str,
    pub estimated_value: f64,
    pub decision: &'a str,
    pub confidence: f64,
}

pub fn render_tiebreaker_prompt(
    item: &ValuationPromptInput<'_>,
    digest: &[VoteDigestLine<'_>],
    buy_weight: f64,
    sell_weight: f64,
) -> PromptInstance {
    let base = render_valuation_prompt(&ValuationPromptInput {
        text_only: true,
        ..item.clone()
    });
    let base_user = base
        .user
        .trim_end_matches("Return the JSON object now.\njson:")
        .trim_end();

    let lines: Vec<String> = digest
        .iter()
        .map(|v| {
            format!(
                "- {}: ${:.2} {} (confidence {:.2})",
                escape_xml_chars(v.provider_id),
                v.estimated_value,
                v.decision,
                v.confidence
            )
        })
        .collect();

    let user = format!(
        "{base_user}\n\n<panel_votes>\n{}\n</panel_votes>\n\nWeighted tally: BUY {buy_weight:.3} vs SELL {sell_weight:.3}. The panel is too close to call.\nReturn the JSON object now.\njson:",
        lines.join("\n")
    );

    PromptInstance {
        template_slug: TIEBREAKER_SLUG.to_string(),
        system: TIEBREAKER_SYSTEM.to_string(),
        user,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ValuationPromptInput<'static> {
        ValuationPromptInput {
            item_name_hint: "Nintendo 64 console",
            description: Some("with two controllers"),
            category: "video_games",
            asking_price: Some(60.0),
            location_hint: None,
            image_count: 2,
            text_only: false,
        }
    }

    #[test]
    fn valuation_prompt_demands_json_only() {
        let p = render_valuation_prompt(&input());
        assert!(p.system.contains("ONLY a JSON object"));
        assert!(p.user.contains("<item_name>Nintendo 64 console</item_name>"));
        assert!(p.user.contains("<asking_price>$60.00</asking_price>"));
        assert!(p.user.contains("<category_guidance>"));
        assert!(p.user.contains("2 photo(s)"));
    }

    #[test]
    fn text_only_prompt_is_strengthened() {
        let p = render_valuation_prompt(&ValuationPromptInput {
            text_only: true,
            ..input()
        });
        assert!(p.user.contains("cannot see the photos"));
        assert!(!p.user.contains("photo(s) of the item are attached"));
    }

    #[test]
    fn text_only_variant_matches_direct_rendering() {
        let vision = render_valuation_prompt(&input());
        let text = vision.text_only();
        assert!(!text.user.contains(PHOTOS_ATTACHED));
        assert!(text.user.contains(TEXT_ONLY_NOTICE));
        assert!(text.user.ends_with("json:"));
        assert_eq!(text.text_only().user, text.user);
    }

    #[test]
    fn xml_escaping() {
        let p = render_valuation_prompt(&ValuationPromptInput {
            item_name_hint: "<script>alert('x')</script>",
            ..input()
        });
        assert!(p.user.contains("&lt;script&gt;"));
        assert!(!p.user.contains("<script>"));
    }

    #[test]
    fn tiebreaker_prompt_lists_every_vote() {
        let digest = vec![
            VoteDigestLine {
                provider_id: "openai",
                estimated_value: 40.0,
                decision: "BUY",
                confidence: 0.8,
            },
            VoteDigestLine {
                provider_id: "groq",
                estimated_value: 12.0,
                decision: "SELL",
                confidence: 0.7,
            },
        ];
        let p = render_tiebreaker_prompt(&input(), &digest, 0.8, 0.7);
        assert!(p.user.contains("- openai: $40.00 BUY"));
        assert!(p.user.contains("- groq: $12.00 SELL"));
        assert!(p.user.contains("selected_provider") || p.system.contains("selected_provider"));
        assert_eq!(p.user.matches("json:").count(), 1);
    }
}
