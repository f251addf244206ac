//! Cache keys for HTTP requests.

use color_eyre::{eyre::eyre, Result};
use sha2::{Digest, Sha256};
use url::Url;

/// Requests whose results the front end caches.
#[derive(Clone, Debug)]
pub enum RequestKey {
  /// Plain GET of a JSON document
  Get { url: Url },
  /// Paginated GET; the cursor travels in `cursor_param`
  Pages { url: Url, cursor_param: String },
}

impl RequestKey {
  pub fn get(url: &str) -> Result<Self> {
    Ok(Self::Get {
      url: normalize_url(url)?,
    })
  }

  pub fn pages(url: &str, cursor_param: &str) -> Result<Self> {
    Ok(Self::Pages {
      url: normalize_url(url)?,
      cursor_param: cursor_param.to_string(),
    })
  }

  pub fn url(&self) -> &Url {
    match self {
      Self::Get { url } | Self::Pages { url, .. } => url,
    }
  }

  /// Stable, fixed-length store key.
  pub fn cache_hash(&self) -> String {
    let input = match self {
      Self::Get { url } => format!("GET {}", url),
      Self::Pages { url, cursor_param } => format!("GET {} pages:{}", url, cursor_param),
    };

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    match self {
      Self::Get { url } => format!("GET {}", url),
      Self::Pages { url, cursor_param } => format!("GET {} (paged by {})", url, cursor_param),
    }
  }
}

/// Parse `raw` and normalize it so equivalent URLs hash alike.
///
/// Scheme and host are lowercased and default ports dropped by the parser;
/// the fragment is removed and query pairs are sorted.
pub fn normalize_url(raw: &str) -> Result<Url> {
  let mut url = Url::parse(raw.trim()).map_err(|e| eyre!("Invalid URL {:?}: {}", raw, e))?;
  if !matches!(url.scheme(), "http" | "https") {
    return Err(eyre!("Unsupported URL scheme: {}", url.scheme()));
  }
  url.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
  if pairs.is_empty() {
    url.set_query(None);
  } else {
    pairs.sort();
    url.query_pairs_mut().clear().extend_pairs(pairs);
  }

  Ok(url)
}
