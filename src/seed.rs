use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::DatabaseProxy;

struct TestUser {
    id: &'static str,
    email: &'static str,
    username: &'static str,
    password: &'static str,
    role: &'static str,
}

const TEST_USERS: &[TestUser] = &[
    TestUser {
        id: "seed-student",
        email: "estudiante@example.com",
        username: "estudiante",
        password: "Estudiante123!",
        role: "STUDENT",
    },
    TestUser {
        id: "seed-teacher",
        email: "docente@example.com",
        username: "docente",
        password: "Docente123!",
        role: "TEACHER",
    },
];

pub async fn seed_test_data(proxy: &DatabaseProxy) {
    let node_env = std::env::var("NODE_ENV").unwrap_or_default();
    if node_env != "test" && node_env != "development" {
        return;
    }

    tracing::info!(env = %node_env, "seeding test users and demo course...");

    let pool = proxy.pool();
    seed_test_users(pool).await;
    seed_demo_course(pool).await;
}

async fn seed_test_users(pool: &PgPool) {
    for user in TEST_USERS {
        let existing: Option<String> =
            sqlx::query(r#"SELECT "id" FROM "users" WHERE "email" = $1"#)
                .bind(user.email)
                .fetch_optional(pool)
                .await
                .ok()
                .flatten()
                .and_then(|row| row.try_get("id").ok());

        if existing.is_some() {
            tracing::debug!(email = user.email, "test user already exists");
            continue;
        }

        let password_hash = match bcrypt::hash(user.password, 10) {
            Ok(hash) => hash,
            Err(err) => {
                tracing::warn!(error = %err, email = user.email, "failed to hash password");
                continue;
            }
        };

        let now = chrono::Utc::now().naive_utc();
        if let Err(err) = sqlx::query(
            r#"
            INSERT INTO "users" ("id","email","passwordHash","username","role","createdAt","updatedAt")
            VALUES ($1,$2,$3,$4,$5,$6,$6)
            "#,
        )
        .bind(user.id)
        .bind(user.email)
        .bind(&password_hash)
        .bind(user.username)
        .bind(user.role)
        .bind(now)
        .execute(pool)
        .await
        {
            tracing::warn!(error = %err, email = user.email, "failed to seed test user");
        } else {
            tracing::info!(email = user.email, role = user.role, "seeded test user");
        }
    }
}

struct DemoSubtopic {
    id: &'static str,
    domain: &'static str,
    name: &'static str,
    prerequisites: &'static [&'static str],
    exercises: &'static [(&'static str, &'static str)],
}

const DEMO_SUBTOPICS: &[DemoSubtopic] = &[
    DemoSubtopic {
        id: "demo-sub-naturales",
        domain: "demo-dom-aritmetica",
        name: "Números naturales",
        prerequisites: &[],
        exercises: &[("¿Cuánto es 7 + 5?", "12"), ("¿Cuánto es 9 - 4?", "5")],
    },
    DemoSubtopic {
        id: "demo-sub-fracciones",
        domain: "demo-dom-aritmetica",
        name: "Fracciones",
        prerequisites: &["demo-sub-naturales"],
        exercises: &[("¿Cuánto es 1/2 + 1/4?", "3/4"), ("Simplifica 4/8", "1/2")],
    },
    DemoSubtopic {
        id: "demo-sub-ecuaciones",
        domain: "demo-dom-algebra",
        name: "Ecuaciones lineales",
        prerequisites: &["demo-sub-fracciones"],
        exercises: &[("Resuelve 2x = 10", "5"), ("Resuelve x + 3 = 7", "4")],
    },
];

async fn seed_demo_course(pool: &PgPool) {
    let existing: Option<String> =
        sqlx::query(r#"SELECT "id" FROM "courses" WHERE "id" = 'demo-course'"#)
            .fetch_optional(pool)
            .await
            .ok()
            .flatten()
            .and_then(|row| row.try_get("id").ok());

    if existing.is_some() {
        tracing::debug!("demo course already exists");
        return;
    }

    let result = insert_demo_course(pool).await;
    match result {
        Ok(()) => tracing::info!("seeded demo course with diagnostic assessment"),
        Err(err) => tracing::warn!(error = %err, "failed to seed demo course"),
    }
}

async fn insert_demo_course(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"INSERT INTO "courses" ("id","title","description") VALUES ('demo-course','Matemáticas básicas','Curso de demostración')"#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"INSERT INTO "course_instances" ("id","courseId","term") VALUES ('demo-instance','demo-course','2026-1')"#,
    )
    .execute(&mut *tx)
    .await?;

    for (id, name) in [
        ("demo-dom-aritmetica", "Aritmética"),
        ("demo-dom-algebra", "Álgebra"),
    ] {
        sqlx::query(r#"INSERT INTO "domains" ("id","courseId","name") VALUES ($1,'demo-course',$2)"#)
            .bind(id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO "assessments" ("id","courseId","title","type","status")
        VALUES ('demo-assessment','demo-course','Diagnóstico de matemáticas','DIAGNOSTIC','PUBLISHED')
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for subtopic in DEMO_SUBTOPICS {
        sqlx::query(r#"INSERT INTO "subtopics" ("id","domainId","name") VALUES ($1,$2,$3)"#)
            .bind(subtopic.id)
            .bind(subtopic.domain)
            .bind(subtopic.name)
            .execute(&mut *tx)
            .await?;

        for prerequisite in subtopic.prerequisites {
            sqlx::query(
                r#"INSERT INTO "subtopic_dependencies" ("subtopicId","prerequisiteId") VALUES ($1,$2)"#,
            )
            .bind(subtopic.id)
            .bind(prerequisite)
            .execute(&mut *tx)
            .await?;
        }

        for (order_index, (statement, answer)) in subtopic.exercises.iter().enumerate() {
            let exercise_id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO "exercises" ("id","subtopicId","statement","expectedAnswer","difficulty","isActive")
                VALUES ($1,$2,$3,$4,$5,TRUE)
                "#,
            )
            .bind(&exercise_id)
            .bind(subtopic.id)
            .bind(statement)
            .bind(answer)
            .bind(1_i32)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO "assessment_exercises" ("id","assessmentId","exerciseId","orderIndex")
                VALUES ($1,'demo-assessment',$2,$3)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&exercise_id)
            .bind(order_index as i32 + 1)
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO "enrollments" ("id","userId","courseInstanceId","status","progress")
        VALUES ('demo-enrollment','seed-student','demo-instance','ACTIVE',0)
        ON CONFLICT DO NOTHING
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
