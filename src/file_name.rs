use std::borrow::Cow;

use reqwest::Url;

/// Stable, filesystem-safe identifier for a media URL: the last path segment
/// with reserved characters dropped and spaces turned into underscores.
/// Query strings don't take part, so signed URLs for one file share a name.
pub fn valid_file_name(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let segment = url.path().rsplit('/').next().unwrap_or_default();
    let decoded = urlencoding::decode(segment).unwrap_or(Cow::Borrowed(segment));

    let name: String = decoded
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://cdn.example.com/music/track01.mp3", Some("track01.mp3"))]
    #[case("https://cdn.example.com/a/b/My%20Song.mp3?sig=abc&exp=1", Some("My_Song.mp3"))]
    #[case("http://cdn.example.com/a/what%3F%22x%22.mp3", Some("whatx.mp3"))]
    #[case("http://cdn.example.com/dir/", None)]
    #[case("http://cdn.example.com", None)]
    #[case("not a url", None)]
    fn derives_file_name(#[case] url: &str, #[case] expected: Option<&str>) {
        assert_eq!(valid_file_name(url).as_deref(), expected);
    }
}
