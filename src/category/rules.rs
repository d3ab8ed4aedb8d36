//! Ordered name-pattern rules.
//!
//! Evaluated top to bottom over the lowercased item name; the first rule whose
//! include set matches and whose exclude set does not wins. Order is part of the
//! contract: a rule that can be falsely triggered by another category's
//! vocabulary sits below the category that owns that vocabulary.

use once_cell::sync::Lazy;
use regex::Regex;

pub struct NameRule {
    pub category: &'static str,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl NameRule {
    fn new(category: &'static str, include: &[&str], exclude: &[&str]) -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("invalid built-in category rule"))
                .collect()
        };
        Self {
            category,
            include: compile(include),
            exclude: compile(exclude),
        }
    }

    /// `name` must already be lowercased.
    pub fn matches(&self, name: &str) -> bool {
        self.include.iter().any(|re| re.is_match(name))
            && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

/// Game, toy and model terms that rule out a real vehicle.
const NOT_A_VEHICLE: &[&str] = &[
    r"\bcards?\b",
    r"\btcg\b",
    r"\bpok[eé]mon\b",
    r"\btopps\b",
    r"\bhot ?wheels\b",
    r"\bmatchbox\b",
    r"\bdie-?cast\b",
    r"\blego\b",
    r"\bmodel kit\b",
    r"\b1:\d{2,3}\b",
    r"\btoy\b",
    r"\bposter\b",
    r"\bmanual\b",
    r"\bkeychain\b",
];

static NAME_RULES: Lazy<Vec<NameRule>> = Lazy::new(|| {
    vec![
        // "33 1/3" would otherwise hit the card serial pattern below.
        NameRule::new(
            "vinyl_records",
            &[
                r"\bvinyl\b",
                r"\blps?\b",
                r"\b33\s*1/3\b",
                r"\b(33|45|78)\s*rpm\b",
                r"\bpicture disc\b",
            ],
            &[
                r"\bvinyl (figure|toy|decal|sticker|siding|flooring|plank|tablecloth)",
                r"\bfunko\b",
            ],
        ),
        // ISBN-13 barcodes.
        NameRule::new("books", &[r"\b97[89]\d{10}\b", r"\bisbn\b"], &[]),
        // CGC grades comics as well as cards; comics claim it first.
        NameRule::new(
            "comics",
            &[
                r"\bcomics?\b",
                r"\bgraphic novel\b",
                r"\b(spider-man|x-men|batman|superman|avengers|hulk)\s*#\s*\d+",
                r"\bcgc\s*\d+(\.\d)?\b",
            ],
            &[r"\bcards?\b"],
        ),
        NameRule::new(
            "video_games",
            &[
                r"\b(nintendo|n64|snes|nes|gamecube|wii|switch|game ?boy|gba|3ds|ds lite)\b",
                r"\b(playstation|ps[1-5]|psp|ps vita|xbox|sega|genesis|dreamcast|atari)\b",
                r"\bvideo ?games?\b",
                r"\b(cib|complete in box)\b",
            ],
            &[r"\btrading cards?\b", r"\bpsa\s*\d", r"\btcg\b"],
        ),
        NameRule::new(
            "trading_cards",
            &[
                r"\bpok[eé]mon\b",
                r"\byu-?gi-?oh\b",
                r"\b(magic the gathering|mtg)\b",
                r"\b(topps|panini|upper deck|bowman|donruss|fleer|prizm)\b",
                r"\b(psa|bgs|sgc)\s*\d+(\.\d)?\b",
                r"\btrading cards?\b",
                r"\b(rookie|rc) cards?\b",
                r"\btcg\b",
                // set serials: 4/102, 25/99, 1/1
                r"\b\d{1,3}/(\d{2,3}|1)\b",
            ],
            &[
                r"\bplush",
                r"\bfunko\b",
                r"\bfigure\b",
                r"\bjersey\b",
                // measurements: 15/16 inch, 1/2 ct, 3/4 sleeve
                r#"\b\d{1,3}/\d{1,3}\s*(?:(?:ct|ctw|carats?|in|inch|inches|oz|lbs?|sleeves?|scale|mm|cm|ft|gal|gallon|hp|cups?)\b|")"#,
            ],
        ),
        NameRule::new(
            "toys",
            &[
                r"\bhot ?wheels\b",
                r"\bmatchbox\b",
                r"\bdie-?cast\b",
                r"\b1:(18|24|43|64)\b",
            ],
            &[],
        ),
        NameRule::new("lego", &[r"\blego\b"], &[]),
        NameRule::new(
            "vehicles",
            &[
                r"\b(19|20)\d{2}\s+(ford|chevy|chevrolet|toyota|honda|nissan|bmw|mercedes|dodge|jeep|tesla|subaru|volkswagen|vw|gmc|ram|harley|kawasaki|yamaha|suzuki|mazda|audi|porsche)\b",
                r"\b(sedan|suv|pickup truck|motorcycle|hatchback|minivan)\b",
                r"\b\d{1,3},?\d{3}\s*(miles|mi)\b",
                r"\bclean title\b",
            ],
            NOT_A_VEHICLE,
        ),
        // Sneakers before streetwear before generic clothing.
        NameRule::new(
            "sneakers",
            &[
                r"\b(air )?jordan\s*\d*\b",
                r"\b(air max|air force 1|af1|yeezy|dunk low|dunk high|sb dunk|nmd|ultraboost)\b",
                r"\bnew balance\b",
                r"\bsneakers?\b",
                r"\btrainers\b",
            ],
            &[r"\bcards?\b", r"\brookie\b", r"\bpsa\b", r"\bposter\b", r"\bjersey\b"],
        ),
        NameRule::new(
            "streetwear",
            &[
                r"\bsupreme\b",
                r"\bbape\b",
                r"\ba bathing ape\b",
                r"\boff-?white\b",
                r"\bpalace\b",
                r"\bst[uü]ssy\b",
                r"\bkith\b",
                r"\bfear of god\b",
            ],
            &[],
        ),
        NameRule::new(
            "clothing",
            &[
                r"\b(t-?shirt|shirt|hoodie|sweatshirt|jacket|coat|jeans|denim|dress|sweater|cardigan|skirt|blouse|pants|shorts)\b",
                r"\blevi'?s\b",
            ],
            &[r"\bdress shoes\b"],
        ),
        NameRule::new(
            "sports_memorabilia",
            &[
                r"\bjersey\b",
                r"\b(signed|autographed) (baseball|football|basketball|helmet|bat|puck|ball)\b",
                r"\bgame-?used\b",
            ],
            &[],
        ),
        NameRule::new(
            "watches",
            &[
                r"\b(rolex|omega|seiko|casio|g-shock|tag heuer|tissot|citizen|tudor|breitling|hamilton)\b",
                r"\bwrist ?watch\b",
                r"\bwatch\b",
            ],
            &[r"\b(apple|galaxy|smart) ?watch\b", r"\bwatch band\b"],
        ),
        NameRule::new(
            "cameras",
            &[
                r"\b(polaroid|leica|hasselblad|dslr|mirrorless|rangefinder)\b",
                r"\b(canon|nikon|pentax|minolta|olympus|fujifilm)\b.*\b(camera|lens|eos|body)\b",
                r"\b\d{2,3}mm f/?\d",
                r"\bfilm camera\b",
            ],
            &[],
        ),
        NameRule::new(
            "electronics",
            &[
                r"\b(iphone|ipad|macbook|imac|airpods|apple watch|galaxy watch|smart ?watch)\b",
                r"\b(laptop|tablet|monitor|television|tv|headphones|speaker|smartphone|gpu|graphics card)\b",
                r"\b(rtx|gtx)\s*\d{3,4}\b",
            ],
            &[],
        ),
        NameRule::new(
            "coins",
            &[
                r"\bcoins?\b",
                r"\b(morgan|peace|walking liberty|silver) (dollar|eagle|half)\b",
                r"\bngc\s*(ms|pf)\s*\d+\b",
                r"\bkrugerrand\b",
            ],
            &[r"\bcoin purse\b", r"\bcoin op\b"],
        ),
        NameRule::new(
            "handbags",
            &[
                r"\b(louis vuitton|lv|chanel|hermes|hermès|gucci|prada|coach|michael kors|kate spade)\b.*\b(bag|purse|tote|wallet|clutch|satchel)\b",
                r"\b(handbag|purse|birkin|neverfull|speedy)\b",
            ],
            &[],
        ),
        NameRule::new(
            "jewelry",
            &[
                r"\b(necklace|bracelet|earrings?|pendant|brooch|engagement ring)\b",
                r"\b(10|14|18|22|24)k\b",
                r"\bsterling silver\b",
                r"\bdiamond\b",
            ],
            &[],
        ),
        NameRule::new(
            "books",
            &[
                r"\b(hardcover|paperback|textbook|novel|first edition book)\b",
                r"\bbooks?\b",
            ],
            &[],
        ),
        NameRule::new(
            "media",
            &[r"\b(dvd|blu-?ray|vhs|cds?|cassette|laserdisc|4k uhd)\b"],
            &[],
        ),
        NameRule::new(
            "musical_instruments",
            &[
                r"\b(guitar|bass guitar|violin|cello|trumpet|saxophone|clarinet|drum kit|drums|synthesizer|ukulele|banjo|mandolin)\b",
                r"\b(fender|gibson|ibanez|yamaha|roland|korg|marshall)\b.*\b(guitar|amp|amplifier|bass|synth|keyboard)\b",
            ],
            &[],
        ),
    ]
});

/// The ordered rule list.
pub fn name_rules() -> &'static [NameRule] {
    &NAME_RULES
}

/// First matching rule's category for a lowercased name.
pub fn match_name(name: &str) -> Option<&'static str> {
    NAME_RULES.iter().find(|r| r.matches(name)).map(|r| r.category)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(category: &str) -> usize {
        name_rules().iter().position(|r| r.category == category).unwrap()
    }

    #[test]
    fn collision_prone_categories_come_first() {
        assert!(position("vinyl_records") < position("trading_cards"));
        assert!(position("toys") < position("vehicles"));
        assert!(position("sneakers") < position("streetwear"));
        assert!(position("streetwear") < position("clothing"));
    }

    #[test]
    fn record_speed_is_not_a_card_serial() {
        assert_eq!(match_name("led zeppelin iv 33 1/3 rpm"), Some("vinyl_records"));
        assert_eq!(match_name("charizard holo 4/102"), Some("trading_cards"));
    }

    #[test]
    fn fractions_are_not_card_serials() {
        let cases = [
            ("14k gold 1/2 ct diamond ring", Some("jewelry")),
            ("3/4 sleeve wool dress", Some("clothing")),
            ("dewalt 1/2 inch drill", None),
            ("craftsman 15/16 inch wrench", None),
            ("mickey mantle 1/1 auto", Some("trading_cards")),
            ("pikachu illustrator 25/99", Some("trading_cards")),
        ];
        for (name, expected) in cases {
            assert_eq!(match_name(name), expected, "{name}");
        }
    }

    #[test]
    fn isbn_barcode_is_a_book() {
        assert_eq!(match_name("9780439708180 sorcerer's stone"), Some("books"));
    }

    #[test]
    fn vehicle_terms_in_card_or_toy_names_are_excluded() {
        assert_eq!(match_name("2019 ford mustang 32,000 miles"), Some("vehicles"));
        assert_eq!(match_name("hot wheels 1967 ford mustang"), Some("toys"));
        assert_eq!(match_name("topps 2020 ford mustang sedan card"), Some("trading_cards"));
        assert_eq!(match_name("lego 2021 ford mustang suv"), Some("lego"));
    }

    #[test]
    fn streetwear_brands_beat_generic_clothing() {
        assert_eq!(match_name("supreme box logo hoodie"), Some("streetwear"));
        assert_eq!(match_name("plain grey hoodie"), Some("clothing"));
        assert_eq!(match_name("air jordan 1 chicago"), Some("sneakers"));
    }

    #[test]
    fn smartwatches_are_electronics() {
        assert_eq!(match_name("apple watch series 8"), Some("electronics"));
        assert_eq!(match_name("seiko 5 automatic watch"), Some("watches"));
    }

    #[test]
    fn vinyl_figures_are_not_records() {
        assert_ne!(match_name("funko pop vinyl figure"), Some("vinyl_records"));
    }

    #[test]
    fn unmatched_name_returns_none() {
        assert_eq!(match_name("oak rocking chair"), None);
    }
}
