//! Price-comparison mode: goals that ask to compare prices fan out over
//! several shopping platforms at once instead of running a planned task.

use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::browser::BrowserRegistry;
use crate::error::BrowserError;
use crate::protocol::ServerMessage;
use crate::types::{PlatformListing, PriceItem};

struct Platform {
    name: &'static str,
    search_url: &'static str,
    base_url: &'static str,
    script: &'static str,
}

const PLATFORMS: [Platform; 3] = [
    Platform {
        name: "Amazon",
        search_url: "https://www.amazon.in/s?k={query}",
        base_url: "https://www.amazon.in",
        script: AMAZON_SCRIPT,
    },
    Platform {
        name: "Flipkart",
        search_url: "https://www.flipkart.com/search?q={query}",
        base_url: "https://www.flipkart.com",
        script: FLIPKART_SCRIPT,
    },
    Platform {
        name: "Meesho",
        search_url: "https://www.meesho.com/search?q={query}",
        base_url: "https://www.meesho.com",
        script: MEESHO_SCRIPT,
    },
];

const AMAZON_SCRIPT: &str = r#"
(() => {
  const cards = Array.from(
    document.querySelectorAll("div[data-component-type='s-search-result']")
  ).slice(0, 10);
  const items = cards.map(card => {
    const title = card.querySelector('h2 a span');
    const link = card.querySelector('h2 a');
    const whole = card.querySelector('span.a-price-whole');
    const frac = card.querySelector('span.a-price-fraction');
    return {
      title: title ? title.textContent.trim() : '',
      url: link ? (link.getAttribute('href') || '') : '',
      price: (whole ? whole.textContent : '') + (frac ? frac.textContent : ''),
    };
  });
  return JSON.stringify(items);
})()
"#;

const FLIPKART_SCRIPT: &str = r#"
(() => {
  const cards = Array.from(document.querySelectorAll('div[data-id]')).slice(0, 10);
  const items = cards.map(card => {
    const titled = card.querySelector('a[title]');
    const fallback = card.querySelector('div._4rR01T');
    const anyLink = card.querySelector('a');
    const price = card.querySelector('div._30jeq3');
    return {
      title: titled
        ? (titled.getAttribute('title') || '')
        : (fallback ? fallback.textContent.trim() : ''),
      url: titled
        ? (titled.getAttribute('href') || '')
        : (anyLink ? (anyLink.getAttribute('href') || '') : ''),
      price: price ? price.textContent : '',
    };
  });
  return JSON.stringify(items);
})()
"#;

const MEESHO_SCRIPT: &str = r#"
(() => {
  const cards = Array.from(
    document.querySelectorAll("a[href*='/product/']")
  ).slice(0, 10);
  const items = cards.map(card => {
    const title = card.querySelector('p');
    const spans = Array.from(card.querySelectorAll('span'));
    return {
      title: title ? title.textContent.trim() : '',
      url: card.getAttribute('href') || '',
      price: spans.map(s => s.textContent).join(' '),
    };
  });
  return JSON.stringify(items);
})()
"#;

static UNDER_CEILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)under\s+([\d,]+)").expect("valid ceiling pattern"));
static FIRST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+[\d,.]*)").expect("valid number pattern"));

pub fn is_price_compare(goal: &str) -> bool {
    let lowered = goal.to_lowercase();
    let price_signal = lowered.contains("under") || lowered.contains("below");
    let compare_signal = lowered.contains("compare");
    let platform_signal = PLATFORMS
        .iter()
        .any(|p| lowered.contains(&p.name.to_lowercase()));
    (price_signal && platform_signal) || compare_signal
}

/// Split a goal like "wireless mouse under 1,500 on amazon" into the
/// product query and the optional price ceiling.
fn parse_goal(goal: &str) -> (String, Option<f64>) {
    let ceiling = UNDER_CEILING
        .captures(goal)
        .and_then(|c| c[1].replace(',', "").parse::<f64>().ok());

    let mut product = UNDER_CEILING.replace_all(goal, " ").to_lowercase();
    for platform in &PLATFORMS {
        product = product.replace(&format!("on {}", platform.name.to_lowercase()), " ");
    }
    let product = product
        .split_whitespace()
        .filter(|word| !matches!(*word, "on" | "price"))
        .collect::<Vec<_>>()
        .join(" ");
    (product, ceiling)
}

fn parse_price(text: &str) -> Option<f64> {
    FIRST_NUMBER
        .captures(text)?
        .get(1)?
        .as_str()
        .replace(',', "")
        .parse()
        .ok()
}

fn urlencode(text: &str) -> String {
    text.replace(' ', "+")
        .replace(['"', '\'', '#'], "")
        .replace('&', "and")
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with('/') {
        format!("{base_url}{href}")
    } else {
        href.to_string()
    }
}

#[derive(Deserialize)]
struct RawItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    price: String,
}

/// Search every platform concurrently with throwaway browser instances and
/// emit one PriceResults payload. Any platform failure fails the flow.
pub async fn run(
    goal: &str,
    registry: &BrowserRegistry,
    events: &mpsc::Sender<ServerMessage>,
) -> Result<(), BrowserError> {
    let (product, ceiling) = parse_goal(goal);
    let limit = ceiling.map_or_else(|| "no limit".to_string(), |c| c.to_string());
    let _ = events
        .send(ServerMessage::info(format!(
            "Price compare: '{product}' under {limit}"
        )))
        .await;

    let scrapes = PLATFORMS
        .iter()
        .map(|platform| scrape(platform, registry, events, &product, ceiling));
    let results: Result<Vec<PlatformListing>, BrowserError> =
        join_all(scrapes).await.into_iter().collect();

    let _ = events
        .send(ServerMessage::PriceResults {
            query: product,
            max_price: ceiling,
            results: results?,
        })
        .await;
    Ok(())
}

async fn scrape(
    platform: &Platform,
    registry: &BrowserRegistry,
    events: &mpsc::Sender<ServerMessage>,
    product: &str,
    ceiling: Option<f64>,
) -> Result<PlatformListing, BrowserError> {
    let browser = registry.ephemeral().await?;
    let url = platform.search_url.replace("{query}", &urlencode(product));
    browser.navigate(&url).await?;
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    let raw = browser.evaluate_json(platform.script).await?;
    let entries: Vec<RawItem> = serde_json::from_value(raw).unwrap_or_default();

    let mut items: Vec<PriceItem> = entries
        .into_iter()
        .filter(|entry| !entry.title.is_empty())
        .map(|entry| PriceItem {
            price: parse_price(&entry.price),
            url: absolutize(platform.base_url, &entry.url),
            title: entry.title,
        })
        .filter(|item| match (ceiling, item.price) {
            (Some(ceiling), Some(price)) => price <= ceiling,
            _ => true,
        })
        .collect();
    items.truncate(3);

    if let Ok(image) = browser.screenshot().await {
        let _ = events
            .send(ServerMessage::BrowserFrame {
                image,
                source: Some(platform.name.to_string()),
            })
            .await;
    }

    Ok(PlatformListing {
        platform: platform.name.to_string(),
        items,
    })
}
