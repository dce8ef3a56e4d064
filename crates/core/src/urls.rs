use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use url::Url;

pub const SPOTIFY_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";

/// Builds the provider consent URL a user is redirected to when connecting.
pub fn spotify_authorize_url(
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> String {
    let scope = scopes.join(" ");
    let params = [
        ("client_id", client_id),
        ("response_type", "code"),
        ("redirect_uri", redirect_uri),
        ("scope", scope.as_str()),
        ("state", state),
        ("show_dialog", "true"),
    ];
    match Url::parse_with_params(SPOTIFY_AUTHORIZE_URL, params) {
        Ok(url) => url.into(),
        Err(_) => SPOTIFY_AUTHORIZE_URL.to_string(),
    }
}

pub fn spotify_track_uri(track_id: &str) -> String {
    format!("spotify:track:{track_id}")
}

/// Encodes a client-supplied id for use as a single URL path segment.
pub fn path_segment(id: &str) -> String {
    utf8_percent_encode(id, NON_ALPHANUMERIC).to_string()
}
