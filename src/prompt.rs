#![forbid(unsafe_code)]

//! Prompt assembly for the subtitle-based tutorial engine.
//!
//! The template below is a contract with the upstream model: the section
//! layout (title, intro, 3-7 key points, 2-3 anticipated questions, one-line
//! summary) is what keeps output quality consistent, so it stays fixed.

/// Upper bound on embedded subtitle text, in characters, to keep the
/// upstream request within limits.
pub const MAX_SUBTITLE_CHARS: usize = 8000;

pub const SYSTEM_PROMPT: &str =
    "你是一位专业的教学内容设计师，擅长将视频内容转化为通俗易懂的图文教程。直接输出内容，不要输出思考过程。";

/// Builds the user prompt from subtitle text and the video title. Pure and
/// deterministic; subtitle text is truncated to [`MAX_SUBTITLE_CHARS`].
pub fn build_tutorial_prompt(subtitle_text: &str, title: &str) -> String {
    let subtitle: String = subtitle_text.chars().take(MAX_SUBTITLE_CHARS).collect();
    let title = if title.is_empty() { "未知" } else { title };
    format!(
        r#"你是一位顶级教学内容设计师。根据以下 B 站视频的字幕内容，生成一篇**结构清晰、适合零基础小白**的图文教程。

## 视频信息
- 标题：{title}

## 字幕原文
{subtitle}

## 教程生成要求
1. **标题**：取一个吸引小白的标题
2. **前言**：一段话概括这个视频讲了什么，让小白知道学完能获得什么
3. **核心知识点**：提炼 3-7 个关键知识点，每个知识点包含：
   - 知识点标题
   - 通俗易懂的解释（用类比、举例）
   - 实操步骤（如果有的话）
4. **常见问题**：预判小白可能遇到的 2-3 个问题，给出解答
5. **总结**：一句话总结核心收获

## 格式要求
- 使用 Markdown 格式
- 用 emoji 让内容更生动
- 语言亲切，像朋友在教你
- 避免专业术语，如果必须用则附上解释
- 不要输出任何思考过程（<think>标签内容），直接输出教程内容"#
    )
}
