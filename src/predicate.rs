// ABOUTME: Typed filter expressions over mirrored entities
// ABOUTME: Field predicates compose with AND/OR/NOT and evaluate against structs directly

use crate::models::{Job, JobStatus, Project, Spider};

/// Implemented by entities that can be tested against a field condition `F`.
pub trait Matches<F> {
    fn matches(&self, field: &F) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate<F> {
    /// Matches everything.
    Any,
    Is(F),
    And(Vec<Predicate<F>>),
    Or(Vec<Predicate<F>>),
    Not(Box<Predicate<F>>),
}

impl<F> Default for Predicate<F> {
    fn default() -> Self {
        Predicate::Any
    }
}

impl<F> Predicate<F> {
    pub fn is(field: F) -> Self {
        Predicate::Is(field)
    }

    pub fn and(self, other: Predicate<F>) -> Self {
        match (self, other) {
            (Predicate::Any, p) | (p, Predicate::Any) => p,
            (Predicate::And(mut left), Predicate::And(right)) => {
                left.extend(right);
                Predicate::And(left)
            }
            (Predicate::And(mut left), p) => {
                left.push(p);
                Predicate::And(left)
            }
            (left, right) => Predicate::And(vec![left, right]),
        }
    }

    pub fn or(self, other: Predicate<F>) -> Self {
        match (self, other) {
            (Predicate::Any, _) | (_, Predicate::Any) => Predicate::Any,
            (Predicate::Or(mut left), Predicate::Or(right)) => {
                left.extend(right);
                Predicate::Or(left)
            }
            (Predicate::Or(mut left), p) => {
                left.push(p);
                Predicate::Or(left)
            }
            (left, right) => Predicate::Or(vec![left, right]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Any of the given fields.
    pub fn one_of(fields: impl IntoIterator<Item = F>) -> Self {
        Predicate::Or(fields.into_iter().map(Predicate::Is).collect())
    }

    pub fn evaluate<T: Matches<F>>(&self, item: &T) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Is(field) => item.matches(field),
            Predicate::And(parts) => parts.iter().all(|p| p.evaluate(item)),
            Predicate::Or(parts) => parts.iter().any(|p| p.evaluate(item)),
            Predicate::Not(inner) => !inner.evaluate(item),
        }
    }

    pub fn filter<T: Matches<F>>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().filter(|item| self.evaluate(item)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectField {
    Name(String),
    Version(String),
    Stale(bool),
    SpidersSynced(bool),
}

impl Matches<ProjectField> for Project {
    fn matches(&self, field: &ProjectField) -> bool {
        match field {
            ProjectField::Name(name) => &self.name == name,
            ProjectField::Version(version) => &self.version == version,
            ProjectField::Stale(stale) => self.stale == *stale,
            ProjectField::SpidersSynced(synced) => self.spiders_synced == *synced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpiderField {
    Name(String),
    Project(String),
    Version(String),
}

impl Matches<SpiderField> for Spider {
    fn matches(&self, field: &SpiderField) -> bool {
        match field {
            SpiderField::Name(name) => &self.name == name,
            SpiderField::Project(project) => &self.project == project,
            SpiderField::Version(version) => &self.version == version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobField {
    Status(JobStatus),
    JobId(String),
    Spider(SpiderField),
}

impl Matches<JobField> for Job {
    fn matches(&self, field: &JobField) -> bool {
        match field {
            JobField::Status(status) => self.status == *status,
            JobField::JobId(id) => &self.job_id == id,
            JobField::Spider(spider) => self.spider.matches(spider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spider(name: &str, project: &str, version: &str) -> Spider {
        Spider {
            id: 1,
            project_id: 1,
            node: "n1".into(),
            project: project.into(),
            version: version.into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_and_or_not_composition() {
        let items = vec![
            spider("items", "shop", "1000"),
            spider("items", "shop", "2000"),
            spider("prices", "shop", "2000"),
            spider("items", "news", "2000"),
        ];

        let pred = Predicate::is(SpiderField::Project("shop".into()))
            .and(Predicate::is(SpiderField::Name("items".into())));
        assert_eq!(pred.filter(items.clone()).len(), 2);

        let pred = Predicate::is(SpiderField::Version("1000".into()))
            .or(Predicate::is(SpiderField::Name("prices".into())));
        assert_eq!(pred.filter(items.clone()).len(), 2);

        let pred = Predicate::is(SpiderField::Project("shop".into())).not();
        let kept = pred.filter(items);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].project, "news");
    }

    #[test]
    fn test_any_is_identity_for_and() {
        let pred: Predicate<SpiderField> =
            Predicate::Any.and(Predicate::is(SpiderField::Name("items".into())));
        assert_eq!(pred, Predicate::Is(SpiderField::Name("items".into())));
        assert!(Predicate::<SpiderField>::default().evaluate(&spider("x", "y", "1")));
    }

    #[test]
    fn test_job_fields_reach_into_spider() {
        let job = Job {
            id: 1,
            node: "n1".into(),
            job_id: "abc".into(),
            spider: spider("items", "shop", "1000"),
            status: JobStatus::Running,
            start_time: chrono::Utc::now(),
            end_time: None,
            pid: Some(42),
            log_url: None,
            items_url: None,
        };
        let active = Predicate::one_of([
            JobField::Status(JobStatus::Pending),
            JobField::Status(JobStatus::Running),
        ]);
        assert!(active
            .and(Predicate::is(JobField::Spider(SpiderField::Name("items".into()))))
            .evaluate(&job));
        assert!(!Predicate::is(JobField::JobId("zzz".into())).evaluate(&job));
    }
}
