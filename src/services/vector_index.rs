use sqlx::PgPool;
use uuid::Uuid;

use super::ports::{VectorIndex, VectorMatch};

struct ChunkEmbeddingRow {
    id: Uuid,
    knowledge_base_id: Uuid,
    embedding: Option<Vec<f32>>,
}

/// Brute-force cosine similarity over `kb_chunks.embedding`, same shape as
/// the pack's SQLite `vector_search_scoped` helper: pull the candidate rows
/// for the caller's knowledge bases, score them in process, keep the top K
/// above threshold. Fine at the scale a single tenant's knowledge bases run
/// at; a larger deployment swaps this `VectorIndex` impl for a real ANN
/// index without touching `functions::retrieve`.
pub struct SqlVectorIndex {
    db: PgPool,
}

impl SqlVectorIndex {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait::async_trait]
impl VectorIndex for SqlVectorIndex {
    async fn query(
        &self,
        kb_weights: &[(Uuid, f64)],
        query_embedding: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> anyhow::Result<Vec<VectorMatch>> {
        if kb_weights.is_empty() || query_embedding.is_empty() {
            return Ok(Vec::new());
        }
        let kb_ids: Vec<Uuid> = kb_weights.iter().map(|(id, _)| *id).collect();

        let rows = sqlx::query_as!(
            ChunkEmbeddingRow,
            r#"
            SELECT id, knowledge_base_id, embedding
            FROM kb_chunks
            WHERE knowledge_base_id = ANY($1) AND embedding IS NOT NULL
            "#,
            &kb_ids,
        )
        .fetch_all(&self.db)
        .await?;

        let mut scored: Vec<VectorMatch> = rows
            .into_iter()
            .filter_map(|row| {
                let embedding = row.embedding?;
                let weight = kb_weights
                    .iter()
                    .find(|(id, _)| *id == row.knowledge_base_id)
                    .map(|(_, w)| *w as f32)
                    .unwrap_or(1.0);
                let score = cosine_similarity(query_embedding, &embedding) * weight;
                if score < score_threshold {
                    return None;
                }
                Some(VectorMatch {
                    chunk_id: row.id,
                    knowledge_base_id: row.knowledge_base_id,
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn mismatched_dimensions_score_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn zero_vector_scores_zero_not_nan() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }
}
