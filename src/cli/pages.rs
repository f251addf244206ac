use clap::Args as ClapArgs;
use color_eyre::{eyre::eyre, Result};
use querysync::{CancelToken, Page, PaginatedOptions, QueryClient};
use serde_json::Value;
use tracing::info;

use super::http::HttpClient;
use super::key::RequestKey;
use super::{summarize, timestamp};

#[derive(ClapArgs, Debug)]
pub struct PagesArgs {
  /// URL of the first page
  pub url: String,

  /// Field of the last item whose value is the next cursor
  #[arg(long)]
  pub cursor_field: String,

  /// Query parameter carrying the cursor
  #[arg(long, default_value = "cursor")]
  pub param: String,

  /// Field holding the item array (default: the response is the array)
  #[arg(long)]
  pub items_field: Option<String>,

  /// Stop after this many pages
  #[arg(long, default_value_t = 10)]
  pub max_pages: usize,

  /// Print every item
  #[arg(long)]
  pub print: bool,
}

type Cursor = Option<String>;

pub async fn run(client: &QueryClient, http: HttpClient, args: PagesArgs) -> Result<()> {
  let key = RequestKey::pages(&args.url, &args.param)?;
  let base_url = key.url().clone();

  let options = PaginatedOptions::new(None, next_cursor(args.cursor_field.clone(), args.max_pages))
    .with_query_options(
      client
        .query_options()
        .with_refetch_on_window_focus(false)
        .with_refetch_on_mount(false),
    );

  let param = args.param.clone();
  let items_field = args.items_field.clone();
  let query = client.paginated(
    key.cache_hash(),
    move |cursor: Cursor, cancel: CancelToken| {
      let http = http.clone();
      let items_field = items_field.clone();
      let mut url = base_url.clone();
      if let Some(cursor) = &cursor {
        url.query_pairs_mut().append_pair(&param, cursor);
      }
      async move {
        let body = http.get_json(&url, &cancel).await?;
        extract_items(body, items_field.as_deref())
      }
    },
    options,
  )?;
  info!(request = %key.description(), max_pages = args.max_pages, "paging");

  query.refetch().await;
  if let Some(err) = query.error() {
    return Err(eyre!("first page failed: {err}"));
  }
  while query.has_next_page() {
    query.fetch_next_page().await;
    if let Some(err) = query.error() {
      return Err(eyre!("page {} failed: {err}", query.pages().len() + 1));
    }
  }

  for (n, page) in query.pages().iter().enumerate() {
    println!(
      "[{}] page {}: {} items (cursor {})",
      timestamp(),
      n + 1,
      page.items.len(),
      page.param.as_deref().unwrap_or("-")
    );
  }
  let items = query.data();
  println!("total: {} items in {} pages", items.len(), query.pages().len());
  if args.print {
    for item in &items {
      println!("{}", summarize(item, 200));
    }
  }

  Ok(())
}

/// Cursor for the page after `last`: the cursor field of its last item.
///
/// Paging ends at an empty page, an item without the field, or `max_pages`.
fn next_cursor(
  field: String,
  max_pages: usize,
) -> impl Fn(&[Value], &[Page<Value, Cursor>]) -> Option<Cursor> + Send + Sync + 'static {
  move |last: &[Value], pages: &[Page<Value, Cursor>]| {
    if pages.len() >= max_pages {
      return None;
    }
    let cursor = match last.last()?.get(&field)? {
      Value::String(s) => s.clone(),
      Value::Null => return None,
      other => other.to_string(),
    };
    Some(Some(cursor))
  }
}

fn extract_items(body: Value, items_field: Option<&str>) -> Result<Vec<Value>> {
  let items = match items_field {
    Some(field) => match body {
      Value::Object(mut map) => map
        .remove(field)
        .ok_or_else(|| eyre!("response has no {:?} field", field))?,
      _ => return Err(eyre!("response is not an object, cannot read {:?}", field)),
    },
    None => body,
  };

  match items {
    Value::Array(items) => Ok(items),
    other => Err(eyre!("expected an array of items, got {}", summarize(&other, 60))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn page(param: Cursor, items: Vec<Value>) -> Page<Value, Cursor> {
    Page { param, items }
  }

  #[test]
  fn test_next_cursor_reads_last_item() {
    let next = next_cursor("id".into(), 10);
    let items = vec![json!({"id": 1}), json!({"id": "b7"})];
    let pages = vec![page(None, items.clone())];
    assert_eq!(next(&items, &pages), Some(Some("b7".to_string())));

    let numeric = vec![json!({"id": 42})];
    assert_eq!(next(&numeric, &pages), Some(Some("42".to_string())));
  }

  #[test]
  fn test_next_cursor_stops() {
    let next = next_cursor("id".into(), 2);
    let items = vec![json!({"id": 1})];
    let one = vec![page(None, items.clone())];
    let two = vec![page(None, items.clone()), page(Some("1".into()), items.clone())];

    assert_eq!(next(&[], &one), None);
    assert_eq!(next(&[json!({"name": "x"})], &one), None);
    assert_eq!(next(&[json!({"id": null})], &one), None);
    assert_eq!(next(&items, &two), None);
  }

  #[test]
  fn test_extract_items() {
    assert_eq!(extract_items(json!([1, 2]), None).unwrap().len(), 2);
    assert_eq!(
      extract_items(json!({"data": [1], "next": "x"}), Some("data")).unwrap(),
      vec![json!(1)]
    );
    assert!(extract_items(json!({"data": 1}), Some("data")).is_err());
    assert!(extract_items(json!({"other": []}), Some("data")).is_err());
    assert!(extract_items(json!({"data": []}), None).is_err());
  }
}
