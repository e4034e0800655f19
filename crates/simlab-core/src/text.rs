/// Strips the indentation shared by all non-blank lines after the first,
/// trims the first line and trailing whitespace elsewhere, and drops blank
/// lines at both ends. Tabs count as eight columns.
pub fn normalize_doc(text: &str) -> String {
    let expanded = text.replace('\t', "        ");
    let lines: Vec<&str> = expanded.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let margin = lines
        .iter()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    out.push(lines[0].trim().to_string());
    for line in lines.iter().skip(1) {
        if line.len() >= margin && line.is_char_boundary(margin) {
            out.push(line[margin..].trim_end().to_string());
        } else {
            out.push(line.trim().to_string());
        }
    }
    while out.first().map(|l| l.trim().is_empty()).unwrap_or(false) {
        out.remove(0);
    }
    while out.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        out.pop();
    }
    out.join("\n")
}
