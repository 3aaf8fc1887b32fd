//! Minimal letter PDF writer.
//!
//! Produces a deterministic single-page A4 document: the recipient address
//! block at the window position, then the letter body. Characters outside
//! Latin-1 are replaced; the composition layer rejects anything the font
//! cannot carry before text gets here.

use crate::models::Address;

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 72.0;
const LEADING: f32 = 14.0;
const MAX_LINE_CHARS: usize = 88;

/// Render letter text (and the address block when sending) to PDF bytes.
pub fn render_letter(text: &str, address: Option<&Address>) -> Vec<u8> {
    let mut lines: Vec<String> = Vec::new();
    if let Some(addr) = address {
        lines.extend(addr.to_address_lines());
        lines.push(String::new());
        lines.push(String::new());
    }
    for paragraph in text.lines() {
        if paragraph.trim().is_empty() {
            lines.push(String::new());
        } else {
            lines.extend(wrap_line(paragraph, MAX_LINE_CHARS));
        }
    }

    let content = content_stream(&lines);
    build_document(&content)
}

fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

fn escape_pdf_text(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for ch in line.chars() {
        match ch {
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 256 => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn content_stream(lines: &[String]) -> String {
    let mut stream = String::new();
    stream.push_str("BT\n/F1 11 Tf\n");
    stream.push_str(&format!("{} {} Td\n{} TL\n", MARGIN, PAGE_HEIGHT - MARGIN, LEADING));
    for line in lines {
        stream.push_str(&format!("({}) Tj\nT*\n", escape_pdf_text(line)));
    }
    stream.push_str("ET\n");
    stream
}

fn build_document(content: &str) -> Vec<u8> {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
             /Resources << /Font << /F1 5 0 R >> >> /Contents 4 0 R >>"
        ),
        format!(
            "<< /Length {} >>\nstream\n{}endstream",
            content.len(),
            content
        ),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Times-Roman >>".to_string(),
    ];

    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_start
        )
        .as_bytes(),
    );
    out
}
