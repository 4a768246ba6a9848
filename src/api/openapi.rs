use super::handlers::{
    auth::{account, login, moderation, oauth, role::Role, types},
    health,
};
use utoipa::{
    openapi::{Contact, InfoBuilder, License},
    OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        login::register,
        login::login,
        login::logout,
        login::session,
        account::update_account,
        oauth::oauth_start,
        oauth::oauth_callback,
        moderation::request_promotion,
        moderation::list_requests,
        moderation::approve_request,
        moderation::reject_request,
        moderation::list_moderators,
        moderation::remove_moderator,
        moderation::set_role,
    ),
    components(schemas(
        health::Health,
        Role,
        types::RegisterForm,
        types::LoginForm,
        types::SessionResponse,
        types::AccountUpdateForm,
        types::PromotionCreated,
        types::PendingPromotionResponse,
        types::PromotionDecision,
        types::ModeratorResponse,
        types::RemoveModeratorRequest,
        types::SetRoleRequest,
    )),
    tags(
        (name = "health", description = "Service and credential store status"),
        (name = "auth", description = "Registration, password and federated login, sessions"),
        (name = "moderation", description = "Moderator promotion and role management")
    )
)]
struct ApiDoc;

/// `OpenAPI` document for every served route, with info taken from Cargo metadata.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();

    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.contact = cargo_contact();
    info.license = cargo_license();
    doc.info = info;

    doc
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (
            optional_str(name),
            optional_str(email.trim_end_matches('>')),
        ),
        None => (optional_str(author), None),
    }
}
