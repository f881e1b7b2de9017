//! RAG用プロンプトの組み立て

use crate::agent::AgentError;
use crate::retrieval::RetrievedSnippet;

/// プロンプトテンプレート
///
/// `{context}` には検索結果のJSON、`{question}` にはユーザーの質問がそのまま入る。
pub const PROMPT_TEMPLATE: &str = "\
下記<context></context>はユーザーから問い合わせられた質問に対して関係があると思われる検索結果の一覧です。
注意深く読んでください。
<context>
{context}
</context>
あなたは親切なAIボットです。ユーザからの質問に対して<context></context>で与えられている情報をもとに誠実に回答します。
ただし、質問に対する答えが<context></context>に書かれていない場合は、正直に「分かりません。」と回答してください。

下記<question></question>がユーザーからの質問です。
<question>
{question}
</question>
ユーザーからの質問に回答してください。

なお、ユーザーからの質問に回答する前に<thinking></thinking>タグで思考過程を記してから回答内容を<answer></answer>に加えてください。
";

/// 質問と検索結果からプロンプトを作る
///
/// 検索結果は入力順のままJSONにする。非ASCII文字はエスケープしない。
pub fn compose_prompt(question: &str, context: &[RetrievedSnippet]) -> Result<String, AgentError> {
    let context_json = serde_json::to_string(context)
        .map_err(|e| AgentError::MessageBuildError(format!("Failed to serialize context: {}", e)))?;

    // 置換は1回ずつ。差し込んだ値の中のプレースホルダは展開しない
    let (head, rest) = PROMPT_TEMPLATE
        .split_once("{context}")
        .ok_or_else(|| AgentError::MessageBuildError("template has no {context}".to_string()))?;
    let (middle, tail) = rest
        .split_once("{question}")
        .ok_or_else(|| AgentError::MessageBuildError("template has no {question}".to_string()))?;

    Ok(format!("{head}{context_json}{middle}{question}{tail}"))
}
