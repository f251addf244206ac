use clap::Args as ClapArgs;
use color_eyre::{eyre::eyre, Result};
use querysync::QueryClient;
use serde_json::Value;
use tracing::{info, warn};

use super::http::HttpClient;
use super::key::normalize_url;

#[derive(ClapArgs, Debug)]
pub struct SendArgs {
  /// Endpoint to POST to
  pub url: String,

  /// JSON request body
  #[arg(long)]
  pub body: String,

  /// Retries after a failed attempt (default: mutation.retry from config)
  #[arg(long)]
  pub retry: Option<u32>,
}

pub async fn run(client: &QueryClient, http: HttpClient, args: SendArgs) -> Result<()> {
  let url = normalize_url(&args.url)?;
  let body: Value =
    serde_json::from_str(&args.body).map_err(|e| eyre!("--body is not valid JSON: {}", e))?;

  let mut options = client.mutation_options::<Value, Value>();
  if let Some(retry) = args.retry {
    let delay = options.retry_delay;
    options = options.with_retry(retry, delay);
  }
  let options = options.on_error(|err, _body: &Value| warn!("send failed: {err}"));

  let target = url.clone();
  let mutation = client.mutation(
    move |body: Value| {
      let http = http.clone();
      let url = target.clone();
      async move { http.post_json(&url, &body).await }
    },
    options,
  );
  info!(%url, "sending");

  match mutation.mutate_async(body).await {
    Ok(response) => {
      println!("{}", serde_json::to_string_pretty(&response)?);
      Ok(())
    }
    Err(err) => Err(eyre!(
      "POST {} failed after {} retries: {}",
      url,
      mutation.retry_count(),
      err
    )),
  }
}
