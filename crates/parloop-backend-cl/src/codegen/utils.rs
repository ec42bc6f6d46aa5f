use parloop::ir::types::Literal;

/// Append one line at the given indent depth (two spaces per level).
pub(super) fn push_line(module: &mut String, indent: usize, line: &str) {
    push_block(module, indent, line);
}

/// Append a multi-line block, stripping the common leading indentation so
/// raw-string literals can be written at their natural nesting depth.
pub(super) fn push_block(module: &mut String, indent: usize, block: &str) {
    if block.is_empty() {
        return;
    }
    let pad = "  ".repeat(indent);
    let mut lines: Vec<&str> = block.split('\n').collect();
    if matches!(lines.first(), Some(line) if line.trim().is_empty()) {
        lines.remove(0);
    }
    if matches!(lines.last(), Some(line) if line.trim().is_empty()) {
        lines.pop();
    }

    let mut min_indent = usize::MAX;
    for line in &lines {
        if line.trim().is_empty() {
            continue;
        }
        let count = line.chars().take_while(|c| *c == ' ' || *c == '\t').count();
        min_indent = min_indent.min(count);
    }
    if min_indent == usize::MAX {
        min_indent = 0;
    }

    for line in lines {
        let trimmed = if min_indent > 0 && line.len() >= min_indent {
            &line[min_indent..]
        } else {
            line
        };
        if trimmed.is_empty() {
            module.push('\n');
        } else {
            module.push_str(&pad);
            module.push_str(trimmed);
            module.push('\n');
        }
    }
}

/// Double literal in OpenCL C. Always carries a decimal point or exponent
/// so the constant keeps double type.
pub(super) fn format_f64(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            "-INFINITY".to_string()
        } else {
            "INFINITY".to_string()
        }
    } else {
        let base = value.to_string();
        let needs_decimal = !base.contains('.') && !base.contains('e') && !base.contains('E');
        if needs_decimal {
            format!("{base}.0")
        } else {
            base
        }
    }
}

/// Literal text in OpenCL C. The minimum integers are written as
/// expressions because their absolute value does not parse as a literal.
pub(super) fn literal_text(lit: Literal) -> String {
    match lit {
        Literal::I32(v) if v == i32::MIN => "(-2147483647 - 1)".to_string(),
        Literal::I32(v) => v.to_string(),
        Literal::I64(v) if v == i64::MIN => "(-9223372036854775807L - 1L)".to_string(),
        Literal::I64(v) => format!("{v}L"),
        Literal::F64(v) => format_f64(v),
        Literal::Bool(true) => "1".to_string(),
        Literal::Bool(false) => "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_share_a_common_margin() {
        let mut out = String::new();
        push_block(
            &mut out,
            1,
            r#"
                if (x) {
                  y = 1;
                }
            "#,
        );
        assert_eq!(out, "  if (x) {\n    y = 1;\n  }\n");
    }

    #[test]
    fn doubles_keep_their_type() {
        assert_eq!(format_f64(2.0), "2.0");
        assert_eq!(format_f64(0.5), "0.5");
        assert_eq!(format_f64(1e-9), "1e-9");
        assert_eq!(format_f64(f64::NAN), "NAN");
        assert_eq!(format_f64(f64::NEG_INFINITY), "-INFINITY");
    }

    #[test]
    fn minimum_integers_are_spelled_as_expressions() {
        assert_eq!(literal_text(Literal::I32(i32::MIN)), "(-2147483647 - 1)");
        assert_eq!(
            literal_text(Literal::I64(i64::MIN)),
            "(-9223372036854775807L - 1L)"
        );
        assert_eq!(literal_text(Literal::I64(7)), "7L");
        assert_eq!(literal_text(Literal::Bool(true)), "1");
    }
}
