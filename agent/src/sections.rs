//! `<thinking>` / `<answer>` タグで区切られた出力の分離

use serde::Serialize;

/// 分離した結果。タグが無い場合は空文字列
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedSections {
    pub thinking: String,
    pub answer: String,
}

/// トランスクリプトを思考過程と回答に分離する
///
/// それぞれ最初に現れたタグ対だけを取り出し、前後の空白を取り除く。
/// 2つの検索は独立しており、片方が無くてももう片方は取り出せる。
pub fn parse_sections(transcript: &str) -> ParsedSections {
    ParsedSections {
        thinking: extract_tagged(transcript, "thinking").unwrap_or_default(),
        answer: extract_tagged(transcript, "answer").unwrap_or_default(),
    }
}

/// 最初の `<tag>` から、その後に最初に現れる `</tag>` までを取り出す（非貪欲・改行を含む）
fn extract_tagged(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    let start = text.find(&open)? + open.len();
    let len = text[start..].find(&close)?;
    Some(text[start..start + len].trim().to_string())
}
