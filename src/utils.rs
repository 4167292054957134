/// Reduces a caller-supplied name to a single safe path component.
///
/// Separators, reserved characters and `..` sequences are replaced so the
/// result can never leave the output directory.
pub fn sanitize_filename(input: &str) -> String {
    let mut name = input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string();

    while name.contains("..") {
        name = name.replace("..", "_");
    }
    name.trim_start_matches('.').to_string()
}
