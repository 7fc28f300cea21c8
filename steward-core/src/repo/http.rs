use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header;
use reqwest::StatusCode;
use url::Url;

use super::{FetchOutcome, Repo, RepoError};

/// Repository served over HTTP(S). Conditional revalidation maps onto
/// `If-Modified-Since`; a 304 answer becomes `FetchOutcome::NotModified`.
pub struct HttpRepo {
    base_url: Url,
    client: Client,
}

impl HttpRepo {
    pub fn new(base_url: Url) -> Result<HttpRepo, RepoError> {
        let client = Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| transport_err("client", e))?;

        Ok(HttpRepo { base_url, client })
    }

    fn url_for(&self, relpath: &str) -> Result<Url, RepoError> {
        let mut base = self.base_url.as_str().trim_end_matches('/').to_string();
        base.push('/');
        base.push_str(relpath.trim_start_matches('/'));
        Url::parse(&base).map_err(|e| transport_err(relpath, e))
    }
}

fn transport_err(
    relpath: &str,
    e: impl std::error::Error + Send + Sync + 'static,
) -> RepoError {
    RepoError::Transport(relpath.to_string(), Box::new(e))
}

fn http_date(time: SystemTime) -> String {
    let dt: DateTime<Utc> = time.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

impl Repo for HttpRepo {
    fn get(&self, relpath: &str) -> Result<Vec<u8>, RepoError> {
        let url = self.url_for(relpath)?;
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| transport_err(relpath, e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RepoError::NotFound(relpath.to_string()));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| transport_err(relpath, e))?;
        let bytes = resp.bytes().map_err(|e| transport_err(relpath, e))?;
        Ok(bytes.to_vec())
    }

    fn put(&self, relpath: &str, data: &[u8]) -> Result<(), RepoError> {
        let url = self.url_for(relpath)?;
        self.client
            .put(url)
            .body(data.to_vec())
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_err(relpath, e))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RepoError> {
        // Plain HTTP servers have no listing contract; admin tooling that
        // needs one uses the filesystem transport.
        Err(RepoError::Transport(
            prefix.to_string(),
            "listing is not supported over HTTP".into(),
        ))
    }

    fn delete(&self, relpath: &str) -> Result<(), RepoError> {
        let url = self.url_for(relpath)?;
        let resp = self
            .client
            .delete(url)
            .send()
            .map_err(|e| transport_err(relpath, e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RepoError::NotFound(relpath.to_string()));
        }
        resp.error_for_status()
            .map_err(|e| transport_err(relpath, e))?;
        Ok(())
    }

    fn fetch_to_file(
        &self,
        relpath: &str,
        dest: &Path,
        if_newer_than: Option<SystemTime>,
    ) -> Result<FetchOutcome, RepoError> {
        let url = self.url_for(relpath)?;
        let mut req = self.client.get(url);
        if let Some(mtime) = if_newer_than {
            req = req.header(header::IF_MODIFIED_SINCE, http_date(mtime));
        }

        let mut resp = req.send().map_err(|e| transport_err(relpath, e))?;

        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(RepoError::NotFound(relpath.to_string()));
        }
        if !resp.status().is_success() {
            return Err(RepoError::Transport(
                relpath.to_string(),
                format!("unexpected status {}", resp.status()).into(),
            ));
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::Io(relpath.to_string(), e))?;
        }

        // Download beside the destination and rename into place so an
        // interrupted transfer never leaves a truncated cache entry.
        let tmp = tempfile::NamedTempFile::new_in(
            dest.parent().unwrap_or_else(|| Path::new(".")),
        )
        .map_err(|e| RepoError::Io(relpath.to_string(), e))?;

        {
            let mut file: &File = tmp.as_file();
            resp.copy_to(&mut file)
                .map_err(|e| transport_err(relpath, e))?;
        }

        tmp.persist(dest)
            .map_err(|e| RepoError::Io(relpath.to_string(), e.error))?;
        Ok(FetchOutcome::Fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_date_format() {
        let epoch = SystemTime::UNIX_EPOCH;
        assert_eq!(http_date(epoch), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn test_url_join() {
        let repo = HttpRepo::new(Url::parse("https://repo.example.com/deploy/").unwrap()).unwrap();
        assert_eq!(
            repo.url_for("catalogs/production").unwrap().as_str(),
            "https://repo.example.com/deploy/catalogs/production"
        );
    }
}
