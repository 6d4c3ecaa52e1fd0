pub fn grounded_answer_prompt(query: &str, context_blocks: &str) -> String {
    // Contract with the model:
    // - Use ONLY the archive excerpts provided.
    // - Cite inline as [[chunk:<chunk_id>]].
    // - Say so when the excerpts do not answer the question.
    format!(
        r#"You answer questions about an archive of meeting records.

Rules (non-negotiable):
1) Use ONLY the archive excerpts provided below. Do not invent facts.
2) Every concrete claim MUST include an inline citation marker in the form [[chunk:<chunk_id>]].
3) Cite only chunk ids that appear below.
4) If the excerpts do not answer the question, say that the archive does not record it.

Question:
{query}

Archive excerpts:
{context_blocks}

Output:
- Plain text, a few sentences at most.
- Include inline citations as specified.
"#
    )
}
