//! Raw listing to canonical product conversion.

use std::sync::LazyLock;

use pricehub_core::{Marketplace, Product, RatingScale, RawListing};
use regex::Regex;
use url::Url;

use crate::extract::text_or_none;

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("number pattern"));

/// A `None` canonical name keeps the matched text.
static BRANDS: LazyLock<Vec<(Regex, Option<&'static str>)>> = LazyLock::new(|| {
    [
        (r"(?i)^(apple|iphone|ipad|macbook)", Some("Apple")),
        (r"(?i)^(samsung|galaxy)\b", Some("Samsung")),
        (r"(?i)^(hp|dell|lenovo|acer|asus|msi|razer)\b", None),
        (r"(?i)^(sony|lg|tcl|haier|hisense)\b", None),
        (r"(?i)^(nike|adidas|puma)\b", None),
        (r"(?i)^(xiaomi|huawei|oneplus|oppo|vivo|realme|infinix|tecno)\b", None),
        (r"(?i)^(canon|nikon|fujifilm|gopro|dji)\b", None),
        (r"(?i)^(microsoft|surface)\b", Some("Microsoft")),
        (r"(?i)^(google|pixel)\b", Some("Google")),
    ]
    .into_iter()
    .map(|(pattern, canonical)| (Regex::new(pattern).expect("brand pattern"), canonical))
    .collect()
});

const PLACEHOLDER_MARKERS: [&str; 11] = [
    "placeholder",
    "lazy",
    "loading",
    "1x1.",
    "blank",
    "spacer",
    "transparent",
    "data:image/gif",
    "data:image/svg",
    ".svg",
    "default-image",
];

static PRODUCT_IMAGE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(/(product|upload|media|cdn|asset|images?|photos?)s?/|\.(jpe?g|png|webp)(\?|$))")
        .expect("image hint pattern")
});

pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    NUMBER.find(&cleaned)?.as_str().parse().ok()
}

pub fn repair_url(href: &str, marketplace: Marketplace) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let parsed = if let Some(rest) = href.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()?
    } else {
        match Url::parse(href) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(marketplace.origin()).ok()?.join(href).ok()?
            }
            Err(_) => return None,
        }
    };
    matches!(parsed.scheme(), "http" | "https").then(|| parsed.to_string())
}

pub fn normalize_rating(text: &str, scale: RatingScale) -> Option<f64> {
    let value = parse_price(text)?;
    let stars = match scale {
        RatingScale::FiveStar => value,
        RatingScale::Percent => value / 20.0,
    };
    let stars = (stars * 100.0).round() / 100.0;
    (0.0..=5.0).contains(&stars).then_some(stars)
}

pub fn extract_company(name: &str) -> Option<String> {
    let name = name.trim();
    for (pattern, canonical) in BRANDS.iter() {
        if let Some(found) = pattern.captures(name).and_then(|c| c.get(1)) {
            return Some(match canonical {
                Some(brand) => brand.to_string(),
                None => found.as_str().to_string(),
            });
        }
    }
    let first = name.split_whitespace().next()?;
    first
        .chars()
        .next()
        .is_some_and(|c| c.is_uppercase())
        .then(|| first.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|word| !word.is_empty())
}

/// Rejects lazy-load placeholders and tracking pixels; accepts URLs that look like product imagery.
pub fn is_usable_image_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    if lower.len() < 25 || PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    PRODUCT_IMAGE_HINT.is_match(&lower)
}

/// Returns `None` only when the listing has no usable name; other fields degrade individually.
pub fn normalize(raw: &RawListing) -> Option<Product> {
    let marketplace = raw.marketplace;
    let name = raw.title.clone().and_then(text_or_none)?;
    let company = raw
        .brand
        .clone()
        .and_then(text_or_none)
        .or_else(|| raw.seller.clone().and_then(text_or_none))
        .or_else(|| extract_company(&name));

    Some(Product {
        price: raw.price_text.as_deref().and_then(parse_price),
        currency: marketplace.currency().to_string(),
        url: raw.href.as_deref().and_then(|h| repair_url(h, marketplace)),
        image_url: raw.image.as_deref().and_then(|h| repair_url(h, marketplace)),
        rating: raw
            .rating_text
            .as_deref()
            .and_then(|r| normalize_rating(r, marketplace.rating_scale())),
        moq: raw.moq.clone().and_then(text_or_none),
        company,
        marketplace,
        name,
        relevance_score: 0,
    })
}
