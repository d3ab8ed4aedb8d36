//! Keyword-overlap scoring, the last classification stage.

/// Categories and the keywords that vote for them. Declaration order breaks ties.
const KEYWORDS: &[(&str, &[&str])] = &[
    ("furniture", &["chair", "table", "dresser", "sofa", "couch", "desk", "cabinet", "nightstand", "bookshelf", "ottoman", "armoire", "credenza", "mid century"]),
    ("tools", &["drill", "dewalt", "milwaukee", "makita", "ryobi", "saw", "wrench", "socket set", "sander", "grinder", "impact driver", "snap-on"]),
    ("kitchenware", &["pyrex", "le creuset", "cast iron", "skillet", "dutch oven", "kitchenaid", "mixer", "corningware", "fire king", "dinnerware"]),
    ("art", &["painting", "lithograph", "canvas", "sculpture", "framed print", "oil on", "watercolor", "etching", "signed print"]),
    ("collectibles", &["figurine", "funko", "hummel", "precious moments", "beanie", "limited edition", "statue", "bobblehead", "snow globe", "vintage sign"]),
    ("toys", &["doll", "action figure", "barbie", "plush", "nerf", "playset", "puzzle", "board game", "stuffed"]),
    ("electronics", &["charger", "bluetooth", "wireless", "console", "router", "usb", "battery pack", "projector", "drone"]),
    ("sporting_goods", &["golf", "clubs", "bike", "bicycle", "treadmill", "dumbbell", "kayak", "skateboard", "snowboard", "tennis", "fishing"]),
    ("home_decor", &["vase", "mirror", "lamp", "rug", "candle", "planter", "clock", "tapestry", "wall decor"]),
    ("clothing", &["vintage tee", "size m", "size l", "size s", "apparel", "outfit"]),
    ("jewelry", &["ring", "gold", "silver", "gemstone", "charm"]),
];

/// Minimum score a category needs to be chosen.
pub const MIN_SCORE: usize = 1;

/// Count keyword hits per category over lowercased text; return the best.
pub fn best_category(text: &str) -> Option<(&'static str, usize)> {
    let padded = format!(" {} ", normalize(text));
    let mut best: Option<(&'static str, usize)> = None;
    for (category, words) in KEYWORDS {
        let score = words
            .iter()
            .filter(|w| padded.contains(&format!(" {w} ")))
            .count();
        if score >= MIN_SCORE && best.map_or(true, |(_, s)| score > s) {
            best = Some((*category, score));
        }
    }
    best
}

/// Lowercase and collapse punctuation to single spaces so keywords match whole words.
fn normalize(text: &str) -> String {
    let mapped: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}
