use http::{header::ACCEPT_ENCODING, HeaderMap};

/// Returns whether the client declared it can decode gzip bodies.
///
/// Every `Accept-Encoding` line is considered. A `gzip` (or legacy `x-gzip`) coding counts
/// unless it carries a zero quality value, which is an explicit refusal.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| {
            let mut params = coding.split(';');
            let name = params.next().unwrap_or_default().trim();

            if !name.eq_ignore_ascii_case("gzip") && !name.eq_ignore_ascii_case("x-gzip") {
                return false;
            }

            params
                .filter_map(|param| param.split_once('='))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("q"))
                .and_then(|(_, q)| q.trim().parse::<f32>().ok())
                .map_or(true, |q| q > 0.0)
        })
}
