use url::Url;

/// Resolves a channel reference to its fully qualified URL form.
///
/// Users mostly refer to channels by their short name (`conda-forge`), which
/// is shorthand for `<channel_alias>/<name>`. Anything that already carries a
/// scheme is taken verbatim. The result never ends with a `/` so that
/// normalized channels compare equal regardless of how they were written.
pub fn normalize_channel_name(channel_alias: &Url, channel: &str) -> String {
    if channel.contains("://") {
        return channel.trim_end_matches('/').to_string();
    }

    let mut base_url = channel_alias.clone();
    if let Ok(mut segments) = base_url.path_segments_mut() {
        segments.pop_if_empty().push(channel);
    }
    base_url.as_str().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("conda-forge", "https://conda.anaconda.org/conda-forge")]
    #[case("nodefaults", "https://conda.anaconda.org/nodefaults")]
    #[case(
        "https://repo.example.com/main/",
        "https://repo.example.com/main"
    )]
    #[case("file:///opt/channel", "file:///opt/channel")]
    fn normalizes(#[case] channel: &str, #[case] expected: &str) {
        let alias = Url::parse("https://conda.anaconda.org").unwrap();
        assert_eq!(normalize_channel_name(&alias, channel), expected);
    }

    #[test]
    fn respects_alias_with_path() {
        let alias = Url::parse("https://mirror.example.com/conda/").unwrap();
        assert_eq!(
            normalize_channel_name(&alias, "conda-forge"),
            "https://mirror.example.com/conda/conda-forge"
        );
    }
}
