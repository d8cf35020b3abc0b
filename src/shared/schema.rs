diesel::table! {
    tickets (id) {
        id -> Int4,
        user_id -> Nullable<Int4>,
        subject -> Varchar,
        description -> Text,
        source -> Varchar,
        status -> Varchar,
        category -> Nullable<Varchar>,
        priority -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_events (id) {
        id -> Int4,
        ticket_id -> Int4,
        event_type -> Varchar,
        payload -> Nullable<Jsonb>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    ticket_ai (id) {
        id -> Int4,
        ticket_id -> Int4,
        summary -> Nullable<Text>,
        category -> Nullable<Varchar>,
        priority -> Nullable<Varchar>,
        entities -> Nullable<Jsonb>,
        suggested_reply -> Nullable<Text>,
        citations -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_events (id) {
        id -> Int4,
        event_id -> Varchar,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    workflow_runs (id) {
        id -> Uuid,
        workflow -> Varchar,
        trigger_event -> Varchar,
        payload -> Jsonb,
        status -> Varchar,
        attempts -> Int4,
        max_attempts -> Int4,
        wake_at -> Timestamptz,
        output -> Nullable<Jsonb>,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    workflow_steps (id) {
        id -> Uuid,
        run_id -> Uuid,
        step_name -> Varchar,
        status -> Varchar,
        output -> Nullable<Jsonb>,
        completed_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(ticket_events -> tickets (ticket_id));
diesel::joinable!(ticket_ai -> tickets (ticket_id));
diesel::joinable!(workflow_steps -> workflow_runs (run_id));

diesel::allow_tables_to_appear_in_same_query!(
    tickets,
    ticket_events,
    ticket_ai,
    processed_events,
    workflow_runs,
    workflow_steps,
);
