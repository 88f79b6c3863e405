use anyhow::Context;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use gradebook_promotion::models::{ClassInfo, EnrollmentStatus, EvaluationRecord, RawEvaluation, Subject};
use gradebook_promotion::promotion::RosterEntry;
use gradebook_promotion::rules::RawPromotionRule;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let years = vec![(1_i64, "2024-2025"), (2, "2025-2026")];
    for (id, label) in years {
        sqlx::query(
            "INSERT INTO gradebook.school_years (id, label) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET label = EXCLUDED.label",
        )
        .bind(id)
        .bind(label)
        .execute(pool)
        .await?;
    }

    let classes = vec![
        (1_i64, "6ème A", "6ème"),
        (2, "6ème B", "6ème"),
        (3, "5ème A", "5ème"),
        (4, "5ème B", "5ème"),
    ];
    for (id, name, level) in classes {
        sqlx::query(
            "INSERT INTO gradebook.classes (id, name, level) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, level = EXCLUDED.level",
        )
        .bind(id)
        .bind(name)
        .bind(level)
        .execute(pool)
        .await?;
    }

    let subjects = vec![
        (1_i64, "Mathématiques", 4.0_f64),
        (2, "Français", 3.0),
        (3, "Histoire-Géographie", 2.0),
    ];
    for (id, name, coefficient) in subjects {
        sqlx::query(
            "INSERT INTO gradebook.subjects (id, name, coefficient) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, coefficient = EXCLUDED.coefficient",
        )
        .bind(id)
        .bind(name)
        .bind(coefficient)
        .execute(pool)
        .await?;
    }

    let students = vec![
        (1_i64, "Awa Diallo", "enrolled"),
        (2, "Koffi Mensah", "enrolled"),
        (3, "Fatou Ndiaye", "enrolled"),
    ];
    for (id, name, status) in students {
        sqlx::query(
            "INSERT INTO gradebook.students (id, full_name) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET full_name = EXCLUDED.full_name",
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO gradebook.enrollments (student_id, class_id, school_year_id, status)
            VALUES ($1, 1, 1, $2)
            ON CONFLICT (student_id, school_year_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    }

    // (student, subject, semester, type, score)
    let evaluations = vec![
        (1_i64, 1_i64, 1, "devoir1", 16.0_f64),
        (1, 1, 1, "devoir2", 14.0),
        (1, 2, 1, "devoir1", 12.0),
        (1, 2, 2, "composition", 13.5),
        (1, 3, 2, "devoir1", 11.0),
        (2, 1, 1, "devoir1", 7.0),
        (2, 1, 2, "composition", 7.5),
        (2, 2, 1, "devoir1", 8.0),
        (2, 3, 1, "devoir2", 7.5),
        (3, 1, 1, "devoir1", 0.0),
        (3, 2, 1, "composition", 0.0),
    ];
    for (index, (student_id, subject_id, semester, evaluation_type, score)) in
        evaluations.into_iter().enumerate()
    {
        sqlx::query(
            r#"
            INSERT INTO gradebook.evaluations
            (student_id, subject_id, course_id, school_year_id, semester,
             evaluation_type, score, coefficient, source_key)
            VALUES ($1, $2, $2, 1, $3, $4, $5, NULL, $6)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(student_id)
        .bind(subject_id)
        .bind(semester)
        .bind(evaluation_type)
        .bind(score)
        .bind(format!("seed-{:03}", index + 1))
        .execute(pool)
        .await?;
    }

    let has_rule: i64 = sqlx::query("SELECT COUNT(*) AS n FROM gradebook.promotion_rules")
        .fetch_one(pool)
        .await?
        .get("n");
    if has_rule == 0 {
        sqlx::query(
            r#"
            INSERT INTO gradebook.promotion_rules
            (minimum_average, required_enrollment_status, direct_transfer, disable_year_after_transfer)
            VALUES (8.0, 'enrolled', TRUE, TRUE)
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: i64,
        subject_id: i64,
        course_id: i64,
        school_year_id: i64,
        semester: i32,
        evaluation_type: String,
        score: f64,
        coefficient: Option<f64>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("malformed CSV row at line {line}"))?;
        let record = EvaluationRecord::try_from(RawEvaluation {
            student_id: row.student_id,
            subject_id: row.subject_id,
            course_id: row.course_id,
            school_year_id: row.school_year_id,
            semester: row.semester,
            evaluation_type: row.evaluation_type,
            score: row.score,
            coefficient: row.coefficient,
        })
        .with_context(|| format!("invalid evaluation at line {line}"))?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO gradebook.evaluations
            (student_id, subject_id, course_id, school_year_id, semester,
             evaluation_type, score, coefficient, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(record.student_id)
        .bind(record.subject_id)
        .bind(record.course_id)
        .bind(record.school_year_id)
        .bind(record.semester.number())
        .bind(record.evaluation_type.to_string())
        .bind(record.score)
        .bind(record.record_coefficient)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn evaluations_from_rows(rows: Vec<sqlx::postgres::PgRow>) -> Vec<EvaluationRecord> {
    let mut evaluations = Vec::with_capacity(rows.len());

    for row in rows {
        let raw = RawEvaluation {
            student_id: row.get("student_id"),
            subject_id: row.get("subject_id"),
            course_id: row.get("course_id"),
            school_year_id: row.get("school_year_id"),
            semester: row.get("semester"),
            evaluation_type: row.get("evaluation_type"),
            score: row.get("score"),
            coefficient: row.get("coefficient"),
        };
        let id: i64 = row.get("id");

        match EvaluationRecord::try_from(raw) {
            Ok(record) => evaluations.push(record),
            Err(err) => warn!(evaluation_id = id, %err, "skipping invalid stored evaluation"),
        }
    }

    evaluations
}

pub async fn fetch_evaluations(
    pool: &PgPool,
    student_id: i64,
    school_year_id: Option<i64>,
) -> anyhow::Result<Vec<EvaluationRecord>> {
    let mut query = String::from(
        "SELECT id, student_id, subject_id, course_id, school_year_id, semester, \
         evaluation_type, score, coefficient \
         FROM gradebook.evaluations \
         WHERE student_id = $1",
    );

    if school_year_id.is_some() {
        query.push_str(" AND school_year_id = $2");
    }
    query.push_str(" ORDER BY school_year_id, subject_id, semester, id");

    let mut rows = sqlx::query(&query).bind(student_id);
    if let Some(value) = school_year_id {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    Ok(evaluations_from_rows(records))
}

pub async fn fetch_class_evaluations(
    pool: &PgPool,
    student_ids: &[i64],
    school_year_id: i64,
) -> anyhow::Result<Vec<EvaluationRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, student_id, subject_id, course_id, school_year_id, semester,
               evaluation_type, score, coefficient
        FROM gradebook.evaluations
        WHERE student_id = ANY($1) AND school_year_id = $2
        ORDER BY student_id, subject_id, semester, id
        "#,
    )
    .bind(student_ids)
    .bind(school_year_id)
    .fetch_all(pool)
    .await?;

    Ok(evaluations_from_rows(rows))
}

pub async fn fetch_subjects(pool: &PgPool) -> anyhow::Result<Vec<Subject>> {
    let rows = sqlx::query("SELECT id, name, coefficient FROM gradebook.subjects ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut subjects = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let name: String = row.get("name");
        let subject = Subject::new(id, name, row.get("coefficient"))
            .with_context(|| format!("subject {id} in the catalog is invalid"))?;
        subjects.push(subject);
    }

    Ok(subjects)
}

pub async fn fetch_classes(pool: &PgPool) -> anyhow::Result<Vec<ClassInfo>> {
    let rows = sqlx::query("SELECT id, name, level FROM gradebook.classes ORDER BY name")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| ClassInfo {
            id: row.get("id"),
            name: row.get("name"),
            level: row.get("level"),
        })
        .collect())
}

pub async fn fetch_class(pool: &PgPool, class_id: i64) -> anyhow::Result<ClassInfo> {
    let row = sqlx::query("SELECT id, name, level FROM gradebook.classes WHERE id = $1")
        .bind(class_id)
        .fetch_optional(pool)
        .await?
        .with_context(|| format!("class {class_id} does not exist"))?;

    Ok(ClassInfo {
        id: row.get("id"),
        name: row.get("name"),
        level: row.get("level"),
    })
}

pub async fn fetch_roster(
    pool: &PgPool,
    class_id: i64,
    school_year_id: i64,
) -> anyhow::Result<Vec<RosterEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id AS enrollment_id, s.id AS student_id, s.full_name, e.status
        FROM gradebook.enrollments e
        JOIN gradebook.students s ON s.id = e.student_id
        WHERE e.class_id = $1 AND e.school_year_id = $2 AND e.is_active
        ORDER BY s.full_name
        "#,
    )
    .bind(class_id)
    .bind(school_year_id)
    .fetch_all(pool)
    .await?;

    let mut roster = Vec::with_capacity(rows.len());
    for row in rows {
        let student_id: i64 = row.get("student_id");
        let status: String = row.get("status");
        let status: EnrollmentStatus = status
            .parse()
            .with_context(|| format!("enrollment of student {student_id} has a bad status"))?;

        roster.push(RosterEntry {
            student_id,
            student_name: row.get("full_name"),
            enrollment_id: row.get("enrollment_id"),
            status,
        });
    }

    Ok(roster)
}

pub async fn fetch_active_rule(pool: &PgPool) -> anyhow::Result<Option<(i64, RawPromotionRule)>> {
    let row = sqlx::query(
        r#"
        SELECT id, minimum_average, required_enrollment_status,
               direct_transfer, disable_year_after_transfer
        FROM gradebook.promotion_rules
        WHERE is_active
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        (
            row.get("id"),
            RawPromotionRule {
                minimum_average: row.get("minimum_average"),
                required_enrollment_status: row.get("required_enrollment_status"),
                direct_transfer: row.get("direct_transfer"),
                disable_year_after_transfer: row.get("disable_year_after_transfer"),
            },
        )
    }))
}

/// One promotion to write back to the registry.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub run_id: Uuid,
    pub student_id: i64,
    pub enrollment_id: i64,
    pub from_class: &'a ClassInfo,
    pub to_class: &'a ClassInfo,
    pub from_school_year_id: i64,
    pub to_school_year_id: i64,
    pub general_average: f64,
    pub disable_source_enrollment: bool,
}

/// Returns false when the student is already enrolled for the target year.
pub async fn apply_transfer(pool: &PgPool, request: &TransferRequest<'_>) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO gradebook.enrollments (student_id, class_id, school_year_id, status)
        VALUES ($1, $2, $3, 'enrolled')
        ON CONFLICT (student_id, school_year_id) DO NOTHING
        "#,
    )
    .bind(request.student_id)
    .bind(request.to_class.id)
    .bind(request.to_school_year_id)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    if request.disable_source_enrollment {
        sqlx::query("UPDATE gradebook.enrollments SET is_active = FALSE WHERE id = $1")
            .bind(request.enrollment_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO gradebook.transfers
        (id, run_id, student_id, from_class_id, to_class_id,
         from_school_year_id, to_school_year_id, general_average)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(request.run_id)
    .bind(request.student_id)
    .bind(request.from_class.id)
    .bind(request.to_class.id)
    .bind(request.from_school_year_id)
    .bind(request.to_school_year_id)
    .bind(request.general_average)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}
