//! Web research tools
//!
//! Search and page extraction back the agent's research phase. Both report
//! failures inline as error-tagged tool output so a dead network never
//! aborts a run.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use cardforge_agent::ToolOutput;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; cardforge/0.1)";
const SEARCH_RESULT_LIMIT: usize = 5;
/// Page text is truncated to keep tool results inside the agent's context.
const MAX_PAGE_CHARS: usize = 8000;

/// Search the web and format results as titled link blocks.
pub async fn search_web(client: &reqwest::Client, query: &str) -> ToolOutput {
    debug!(
        component = "tools",
        event = "tools.search",
        query = %query,
        "Running web search"
    );
    match fetch_search_page(client, query).await {
        Ok(html) => ToolOutput::text(format_search_results(&html)),
        Err(e) => ToolOutput::error(format!("Error searching the web: {}", e)),
    }
}

async fn fetch_search_page(client: &reqwest::Client, query: &str) -> Result<String, reqwest::Error> {
    client
        .get(SEARCH_ENDPOINT)
        .query(&[("q", query)])
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

/// Fetch a page and reduce it to readable text.
pub async fn read_page(client: &reqwest::Client, url: &str) -> ToolOutput {
    debug!(
        component = "tools",
        event = "tools.read_page",
        url = %url,
        "Fetching web page"
    );
    let response = match client
        .get(url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(response) => response,
        Err(e) => return ToolOutput::error(format!("Error reading web page: {}", e)),
    };
    match response.text().await {
        Ok(html) => {
            let text = extract_text(&html);
            if text.is_empty() {
                ToolOutput::error("The page contained no readable text.".to_string())
            } else {
                ToolOutput::text(text)
            }
        }
        Err(e) => ToolOutput::error(format!("Error reading web page: {}", e)),
    }
}

fn result_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#)
            .unwrap()
    })
}

fn result_snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#).unwrap()
    })
}

/// Pull the top results out of the search provider's HTML listing.
fn format_search_results(html: &str) -> String {
    let snippets: Vec<String> = result_snippet_re()
        .captures_iter(html)
        .map(|c| extract_text(&c[1]))
        .collect();

    let mut blocks = Vec::new();
    for (i, caps) in result_link_re()
        .captures_iter(html)
        .take(SEARCH_RESULT_LIMIT)
        .enumerate()
    {
        let link = caps[1].trim().to_string();
        let title = extract_text(&caps[2]);
        let snippet = snippets.get(i).cloned().unwrap_or_default();
        blocks.push(format!(
            "Title: {}\nLink: {}\nSnippet: {}",
            title, link, snippet
        ));
    }

    if blocks.is_empty() {
        "No results found.".to_string()
    } else {
        blocks.join("\n\n")
    }
}

/// Strip markup and collapse whitespace. Good enough for study material;
/// not a general HTML renderer.
pub(crate) fn extract_text(html: &str) -> String {
    static SCRIPT_RE: OnceLock<Regex> = OnceLock::new();
    static STYLE_RE: OnceLock<Regex> = OnceLock::new();
    static COMMENT_RE: OnceLock<Regex> = OnceLock::new();
    static BLOCK_END_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    static SPACE_RE: OnceLock<Regex> = OnceLock::new();

    let script = SCRIPT_RE
        .get_or_init(|| Regex::new(r"(?is)<script\b.*?</script>").unwrap());
    let style = STYLE_RE.get_or_init(|| Regex::new(r"(?is)<style\b.*?</style>").unwrap());
    let comment = COMMENT_RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
    let block_end = BLOCK_END_RE
        .get_or_init(|| Regex::new(r"(?i)</(p|div|h[1-6]|li|tr|blockquote)>|<br\s*/?>").unwrap());
    let tag = TAG_RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap());
    let space = SPACE_RE.get_or_init(|| Regex::new(r"[ \t]+").unwrap());

    let text = script.replace_all(html, " ");
    let text = style.replace_all(&text, " ");
    let text = comment.replace_all(&text, " ");
    let text = block_end.replace_all(&text, "\n");
    let text = tag.replace_all(&text, " ");
    let text = decode_entities(&text);
    let text = space.replace_all(&text, " ");

    let mut lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines.dedup();
    let joined = lines.join("\n");
    truncate_chars(&joined, MAX_PAGE_CHARS)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{}\n[truncated]", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_strips_markup_and_scripts() {
        let html = r#"
            <html><head><style>body { color: red; }</style>
            <script>alert("hi")</script></head>
            <body><h1>Borrowing</h1>
            <p>References let you use a value without taking ownership.</p>
            <!-- nav --><div>Rust &amp; safety</div></body></html>
        "#;
        let text = extract_text(html);
        assert!(text.contains("Borrowing"));
        assert!(text.contains("References let you use a value"));
        assert!(text.contains("Rust & safety"));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn extract_text_keeps_block_boundaries_as_lines() {
        let html = "<p>one</p><p>two</p>";
        assert_eq!(extract_text(html), "one\ntwo");
    }

    #[test]
    fn extract_text_truncates_long_pages() {
        let html = format!("<p>{}</p>", "a".repeat(MAX_PAGE_CHARS * 2));
        let text = extract_text(&html);
        assert!(text.ends_with("[truncated]"));
        assert!(text.chars().count() < MAX_PAGE_CHARS + 20);
    }

    #[test]
    fn search_results_format_as_titled_blocks() {
        let html = r#"
            <a rel="nofollow" class="result__a" href="https://example.com/a">First <b>Result</b></a>
            <a class="result__snippet" href="https://example.com/a">About the first thing.</a>
            <a rel="nofollow" class="result__a" href="https://example.com/b">Second Result</a>
            <a class="result__snippet" href="https://example.com/b">About the second thing.</a>
        "#;
        let out = format_search_results(html);
        let blocks: Vec<&str> = out.split("\n\n").collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("Title: First Result"));
        assert!(blocks[0].contains("Link: https://example.com/a"));
        assert!(blocks[0].contains("Snippet: About the first thing."));
        assert!(blocks[1].contains("Second Result"));
    }

    #[test]
    fn empty_listing_reports_no_results() {
        assert_eq!(format_search_results("<html></html>"), "No results found.");
    }

    #[test]
    fn result_limit_caps_the_listing() {
        let mut html = String::new();
        for i in 0..10 {
            html.push_str(&format!(
                r#"<a class="result__a" href="https://example.com/{i}">R{i}</a>"#
            ));
        }
        let out = format_search_results(&html);
        assert_eq!(out.split("\n\n").count(), SEARCH_RESULT_LIMIT);
    }
}
