use chrono::NaiveDate;
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// `{YYYYMMDD}_{basename}`. URLs whose path ends in `/` get a short hashed
/// name instead, so two such URLs on the same day can land on the same file.
pub fn filename_for(url: &Url, today: NaiveDate) -> String {
    let basename = path_basename(url);
    let name = if basename.is_empty() {
        synthetic_name(url)
    } else {
        basename.to_string()
    };
    format!("{}_{name}", today.format("%Y%m%d"))
}

pub fn synthetic_name(url: &Url) -> String {
    format!("image_{}.jpg", xxh3_64(url.as_str().as_bytes()) % 10_000)
}

fn path_basename(url: &Url) -> &str {
    url.path().rsplit('/').next().unwrap_or_default()
}
