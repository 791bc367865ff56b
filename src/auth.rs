use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

/// Pre-authenticated caller identity supplied by the host application.
/// The daemon trusts it and only evaluates business authorization.
#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    UserRead,
    UserUpdate,
    UserWrite,
    SubjectRead,
    SubjectWrite,
    GroupRead,
    GroupWrite,
    GradeRead,
    GradeWrite,
    PerformanceRead,
    PerformanceWrite,
    RemediationRead,
    RemediationWrite,
    RemediationDelete,
    ReportStudent,
    ReportGroup,
    ReportSubject,
    ReportTeacher,
    ReportRemediations,
    WorkspaceAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnershipRule {
    /// Any allowed role, regardless of whose record it is.
    Any,
    /// Students may only touch records about themselves.
    OwnStudent,
    /// Teachers may only touch records about themselves.
    OwnTeacher,
    /// Any non-admin may only touch records about themselves.
    OwnAny,
}

pub struct Denied {
    pub message: &'static str,
}

/// One row per operation family: which non-admin roles may call it, and
/// which ownership constraint applies. Admin always passes.
fn rule(action: Action) -> (&'static [Role], OwnershipRule) {
    use OwnershipRule::*;
    match action {
        Action::UserRead => (&[Role::Teacher, Role::Student], OwnStudent),
        Action::UserUpdate => (&[Role::Teacher, Role::Student], OwnAny),
        Action::UserWrite => (&[], Any),
        Action::SubjectRead => (&[Role::Teacher, Role::Student], Any),
        Action::SubjectWrite => (&[], Any),
        Action::GroupRead => (&[Role::Teacher, Role::Student], Any),
        Action::GroupWrite => (&[], Any),
        Action::GradeRead => (&[Role::Teacher, Role::Student], OwnStudent),
        Action::GradeWrite => (&[Role::Teacher], Any),
        Action::PerformanceRead => (&[Role::Teacher, Role::Student], OwnStudent),
        Action::PerformanceWrite => (&[Role::Teacher], Any),
        Action::RemediationRead => (&[Role::Teacher, Role::Student], OwnStudent),
        Action::RemediationWrite => (&[Role::Teacher], Any),
        Action::RemediationDelete => (&[], Any),
        Action::ReportStudent => (&[Role::Teacher, Role::Student], OwnStudent),
        Action::ReportGroup => (&[Role::Teacher], Any),
        Action::ReportSubject => (&[Role::Teacher], Any),
        Action::ReportTeacher => (&[Role::Teacher], OwnTeacher),
        Action::ReportRemediations => (&[Role::Teacher], Any),
        Action::WorkspaceAdmin => (&[], Any),
    }
}

/// `owner` is the subject of the record being touched (the student a
/// grade belongs to, the teacher a report is about), when the operation
/// has one.
pub fn authorize(action: Action, actor: &Actor, owner: Option<&str>) -> Result<(), Denied> {
    if actor.role == Role::Admin {
        return Ok(());
    }
    let (allowed, ownership) = rule(action);
    if !allowed.contains(&actor.role) {
        return Err(Denied {
            message: "role is not allowed to perform this operation",
        });
    }
    let own_check = match ownership {
        OwnershipRule::Any => None,
        OwnershipRule::OwnStudent if actor.role == Role::Student => Some(owner),
        OwnershipRule::OwnTeacher if actor.role == Role::Teacher => Some(owner),
        OwnershipRule::OwnAny => Some(owner),
        _ => None,
    };
    if let Some(owner) = own_check {
        if owner != Some(actor.id.as_str()) {
            return Err(Denied {
                message: "operation is limited to the caller's own records",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(id: &str, role: Role) -> Actor {
        Actor {
            id: id.to_string(),
            role,
        }
    }

    #[test]
    fn admin_passes_everything() {
        let admin = actor("a1", Role::Admin);
        assert!(authorize(Action::UserWrite, &admin, None).is_ok());
        assert!(authorize(Action::RemediationDelete, &admin, None).is_ok());
        assert!(authorize(Action::ReportTeacher, &admin, Some("t9")).is_ok());
        assert!(authorize(Action::WorkspaceAdmin, &admin, None).is_ok());
    }

    #[test]
    fn students_only_see_their_own_records() {
        let student = actor("s1", Role::Student);
        assert!(authorize(Action::GradeRead, &student, Some("s1")).is_ok());
        assert!(authorize(Action::GradeRead, &student, Some("s2")).is_err());
        assert!(authorize(Action::ReportStudent, &student, Some("s1")).is_ok());
        assert!(authorize(Action::ReportStudent, &student, Some("s2")).is_err());
        assert!(authorize(Action::ReportGroup, &student, None).is_err());
    }

    #[test]
    fn teachers_write_grades_but_not_reference_data() {
        let teacher = actor("t1", Role::Teacher);
        assert!(authorize(Action::GradeWrite, &teacher, None).is_ok());
        assert!(authorize(Action::RemediationWrite, &teacher, None).is_ok());
        assert!(authorize(Action::SubjectWrite, &teacher, None).is_err());
        assert!(authorize(Action::GroupWrite, &teacher, None).is_err());
        assert!(authorize(Action::RemediationDelete, &teacher, None).is_err());
    }

    #[test]
    fn teacher_report_is_self_only_for_teachers() {
        let teacher = actor("t1", Role::Teacher);
        assert!(authorize(Action::ReportTeacher, &teacher, Some("t1")).is_ok());
        assert!(authorize(Action::ReportTeacher, &teacher, Some("t2")).is_err());
    }

    #[test]
    fn profile_updates_are_self_only_for_non_admins() {
        let teacher = actor("t1", Role::Teacher);
        let student = actor("s1", Role::Student);
        assert!(authorize(Action::UserUpdate, &teacher, Some("t1")).is_ok());
        assert!(authorize(Action::UserUpdate, &teacher, Some("s1")).is_err());
        assert!(authorize(Action::UserUpdate, &student, Some("s1")).is_ok());
        assert!(authorize(Action::UserUpdate, &student, Some("t1")).is_err());
    }

    #[test]
    fn teachers_read_any_student_records() {
        let teacher = actor("t1", Role::Teacher);
        assert!(authorize(Action::GradeRead, &teacher, Some("s1")).is_ok());
        assert!(authorize(Action::ReportStudent, &teacher, Some("s1")).is_ok());
    }
}
