use async_trait::async_trait;
use lazy_static::lazy_static;
use log::{ error, info };
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{ json, Value };
use std::time::Duration;

lazy_static! {
    static ref WEB_SEARCH_TOOL: Value =
        json!({
        "type": "function",
        "function": {
            "name": "web_search",
            "description": "Search the internet for information when you do not know the answer or need current events.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query to send to the search engine."
                    }
                },
                "required": ["query"]
            }
        }
    });
}

/// Tool definition advertised to providers that support tool calling.
pub fn web_search_tool_definition() -> Value {
    WEB_SEARCH_TOOL.clone()
}

/// Outbound web-search collaborator, used only inside the tool-call
/// sub-protocol. Never fails: errors come back as a result string the
/// model can read.
#[async_trait]
pub trait SearchTool: Send + Sync {
    async fn search(&self, query: &str) -> String;
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: Option<String>,
}

/// Queries a SearXNG-style JSON search endpoint, retrying with a doubling
/// delay on transient failures.
pub struct HttpSearchTool {
    http: HttpClient,
    endpoint: String,
    max_retries: u32,
}

impl HttpSearchTool {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: HttpClient::new(),
            endpoint,
            max_retries: 3,
        }
    }

    async fn try_search(&self, query: &str) -> Result<String, reqwest::Error> {
        let resp = self.http
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json")])
            .send().await?
            .error_for_status()?
            .json::<SearchResponse>().await?;

        if resp.results.is_empty() {
            return Ok("No results found.".to_string());
        }

        let top_results = resp.results
            .iter()
            .take(5)
            .map(|r| {
                format!(
                    "Title: {}\nURL: {}\nDescription: {}",
                    r.title,
                    r.url,
                    r.description.as_deref().unwrap_or("No description")
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(format!("Search Results for \"{}\":\n\n{}", query, top_results))
    }
}

#[async_trait]
impl SearchTool for HttpSearchTool {
    async fn search(&self, query: &str) -> String {
        let mut delay = Duration::from_secs(2);

        for attempt in 1..=self.max_retries {
            info!("Performing web search for: {} (Attempt {}/{})", query, attempt, self.max_retries);
            match self.try_search(query).await {
                Ok(result) => {
                    return result;
                }
                Err(e) => {
                    error!("Web search error (Attempt {}): {}", attempt, e);
                    if attempt == self.max_retries {
                        return format!("Error performing web search: {}", e);
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}
