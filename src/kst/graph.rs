//! Read-only view of a course's knowledge structure: subtopics grouped into
//! domains plus the directed prerequisite edges between subtopics.
//!
//! Edges are not validated to be acyclic; members of a cycle simply never
//! satisfy the frontier predicate, which keeps them locked until the
//! selection fallback reaches their exercises anyway.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Locked,
    Fringe,
    Completed,
}

#[derive(Debug, Clone)]
pub struct TopicNode {
    pub id: String,
    pub name: String,
    pub domain_id: String,
    pub domain_name: String,
    pub prerequisites: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    topics: Vec<TopicNode>,
    index: HashMap<String, usize>,
}

impl KnowledgeGraph {
    pub fn new(topics: Vec<TopicNode>) -> Self {
        let index = topics
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Self { topics, index }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn topics(&self) -> &[TopicNode] {
        &self.topics
    }

    pub fn get(&self, topic_id: &str) -> Option<&TopicNode> {
        self.index.get(topic_id).map(|i| &self.topics[*i])
    }

    pub fn topic_ids(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.id.clone()).collect()
    }

    pub fn prerequisites_of(&self, topic_id: &str) -> &[String] {
        self.get(topic_id)
            .map(|t| t.prerequisites.as_slice())
            .unwrap_or(&[])
    }

    /// Topics that list `topic_id` as a prerequisite.
    pub fn dependents_of(&self, topic_id: &str) -> Vec<&str> {
        self.topics
            .iter()
            .filter(|t| t.prerequisites.iter().any(|p| p == topic_id))
            .map(|t| t.id.as_str())
            .collect()
    }

    /// A topic is on the learning frontier when it is not yet mastered and
    /// every prerequisite is in the mastered set (vacuously true with none).
    pub fn is_frontier(&self, topic_id: &str, mastered: &HashSet<String>) -> bool {
        if mastered.contains(topic_id) {
            return false;
        }
        self.prerequisites_of(topic_id)
            .iter()
            .all(|p| mastered.contains(p))
    }

    pub fn node_status(&self, topic_id: &str, mastered: &HashSet<String>) -> NodeStatus {
        if mastered.contains(topic_id) {
            NodeStatus::Completed
        } else if self.is_frontier(topic_id, mastered) {
            NodeStatus::Fringe
        } else {
            NodeStatus::Locked
        }
    }
}

pub async fn load_course_graph(
    tx: &mut Transaction<'_, Postgres>,
    course_id: &str,
) -> Result<KnowledgeGraph, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT s."id", s."name", d."id" as "domainId", d."name" as "domainName"
        FROM "subtopics" s
        JOIN "domains" d ON s."domainId" = d."id"
        WHERE d."courseId" = $1
        ORDER BY d."id", s."id"
        "#,
    )
    .bind(course_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut topics: Vec<TopicNode> = rows
        .into_iter()
        .map(|row| TopicNode {
            id: row.try_get("id").unwrap_or_default(),
            name: row.try_get("name").unwrap_or_default(),
            domain_id: row.try_get("domainId").unwrap_or_default(),
            domain_name: row.try_get("domainName").unwrap_or_default(),
            prerequisites: Vec::new(),
        })
        .collect();

    if topics.is_empty() {
        return Ok(KnowledgeGraph::default());
    }

    let edges = sqlx::query(
        r#"
        SELECT sd."subtopicId", sd."prerequisiteId"
        FROM "subtopic_dependencies" sd
        JOIN "subtopics" s ON sd."subtopicId" = s."id"
        JOIN "domains" d ON s."domainId" = d."id"
        WHERE d."courseId" = $1
        "#,
    )
    .bind(course_id)
    .fetch_all(&mut **tx)
    .await?;

    let mut prereq_map: HashMap<String, Vec<String>> = HashMap::new();
    for row in edges {
        let subtopic_id: String = row.try_get("subtopicId").unwrap_or_default();
        let prerequisite_id: String = row.try_get("prerequisiteId").unwrap_or_default();
        prereq_map.entry(subtopic_id).or_default().push(prerequisite_id);
    }

    for topic in &mut topics {
        if let Some(prereqs) = prereq_map.remove(&topic.id) {
            topic.prerequisites = prereqs;
        }
    }

    Ok(KnowledgeGraph::new(topics))
}

pub async fn load_domain_graph(
    pool: &PgPool,
    domain_id: &str,
) -> Result<KnowledgeGraph, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT s."id", s."name", d."id" as "domainId", d."name" as "domainName"
        FROM "subtopics" s
        JOIN "domains" d ON s."domainId" = d."id"
        WHERE d."id" = $1
        ORDER BY s."id"
        "#,
    )
    .bind(domain_id)
    .fetch_all(pool)
    .await?;

    let mut topics: Vec<TopicNode> = rows
        .into_iter()
        .map(|row| TopicNode {
            id: row.try_get("id").unwrap_or_default(),
            name: row.try_get("name").unwrap_or_default(),
            domain_id: row.try_get("domainId").unwrap_or_default(),
            domain_name: row.try_get("domainName").unwrap_or_default(),
            prerequisites: Vec::new(),
        })
        .collect();

    if topics.is_empty() {
        return Ok(KnowledgeGraph::default());
    }

    let edges = sqlx::query(
        r#"
        SELECT sd."subtopicId", sd."prerequisiteId"
        FROM "subtopic_dependencies" sd
        JOIN "subtopics" s ON sd."subtopicId" = s."id"
        WHERE s."domainId" = $1
        "#,
    )
    .bind(domain_id)
    .fetch_all(pool)
    .await?;

    let mut prereq_map: HashMap<String, Vec<String>> = HashMap::new();
    for row in edges {
        let subtopic_id: String = row.try_get("subtopicId").unwrap_or_default();
        let prerequisite_id: String = row.try_get("prerequisiteId").unwrap_or_default();
        prereq_map.entry(subtopic_id).or_default().push(prerequisite_id);
    }

    for topic in &mut topics {
        if let Some(prereqs) = prereq_map.remove(&topic.id) {
            topic.prerequisites = prereqs;
        }
    }

    Ok(KnowledgeGraph::new(topics))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, prereqs: &[&str]) -> TopicNode {
        TopicNode {
            id: id.to_string(),
            name: format!("Tema {id}"),
            domain_id: "d1".to_string(),
            domain_name: "Dominio".to_string(),
            prerequisites: prereqs.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn chain_graph() -> KnowledgeGraph {
        // A -> B -> C
        KnowledgeGraph::new(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
        ])
    }

    #[test]
    fn test_frontier_without_prerequisites() {
        let graph = chain_graph();
        let mastered = HashSet::new();
        assert!(graph.is_frontier("a", &mastered));
        assert!(!graph.is_frontier("b", &mastered));
        assert!(!graph.is_frontier("c", &mastered));
    }

    #[test]
    fn test_frontier_advances_with_mastery() {
        let graph = chain_graph();
        let mastered: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert!(!graph.is_frontier("a", &mastered));
        assert!(graph.is_frontier("b", &mastered));
        assert!(!graph.is_frontier("c", &mastered));
    }

    #[test]
    fn test_node_status() {
        let graph = chain_graph();
        let mastered: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(graph.node_status("a", &mastered), NodeStatus::Completed);
        assert_eq!(graph.node_status("b", &mastered), NodeStatus::Fringe);
        assert_eq!(graph.node_status("c", &mastered), NodeStatus::Locked);
    }

    #[test]
    fn test_dependents() {
        let graph = chain_graph();
        assert_eq!(graph.dependents_of("a"), vec!["b"]);
        assert_eq!(graph.dependents_of("b"), vec!["c"]);
        assert!(graph.dependents_of("c").is_empty());
    }

    #[test]
    fn test_cycle_members_stay_locked() {
        let graph = KnowledgeGraph::new(vec![node("x", &["y"]), node("y", &["x"])]);
        let mastered = HashSet::new();
        assert!(!graph.is_frontier("x", &mastered));
        assert!(!graph.is_frontier("y", &mastered));
        assert_eq!(graph.node_status("x", &mastered), NodeStatus::Locked);
    }
}
